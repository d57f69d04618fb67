//! Minimal INI reader.
//!
//! Keys before the first section header belong to the unnamed default section, which can also be
//! written as `[DEFAULT]`. Lines starting with `#` or `;` are comments, values may be quoted.

use crate::ConfigError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    /// Last value set for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ini {
    // the default section is always first
    sections: Vec<Section>,
}

impl Ini {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut sections = vec![Section::new("")];
        let mut current = 0;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| ConfigError::Parse {
                    line: lineno + 1,
                    message: format!("unterminated section header {line:?}"),
                })?;
                let name = name.trim();
                let name = if name == "DEFAULT" { "" } else { name };

                current = match sections
                    .iter()
                    .position(|s| s.name.eq_ignore_ascii_case(name))
                {
                    Some(index) => index,
                    None => {
                        sections.push(Section::new(name));
                        sections.len() - 1
                    }
                };
                continue;
            }

            let (key, value) = line
                .split_once(['=', ':'])
                .ok_or_else(|| ConfigError::Parse {
                    line: lineno + 1,
                    message: format!("expected 'key = value', got {line:?}"),
                })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::Parse {
                    line: lineno + 1,
                    message: "empty key".to_string(),
                });
            }

            sections[current]
                .entries
                .push((key.to_string(), parse_value(value)));
        }

        Ok(Self { sections })
    }

    /// Section names are domains, so they match regardless of case.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn default_section(&self) -> &Section {
        &self.sections[0]
    }

    /// Names of all named sections, in file order.
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections[1..].iter().map(|s| s.name.as_str())
    }
}

fn parse_value(value: &str) -> String {
    let value = value.trim();

    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }

    // inline comments need leading whitespace, so '#' inside values survives
    let end = value
        .char_indices()
        .find(|&(i, c)| {
            (c == '#' || c == ';')
                && value[..i].ends_with(|p: char| p.is_whitespace())
        })
        .map(|(i, _)| i)
        .unwrap_or(value.len());

    value[..end].trim_end().to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sections() {
        let ini = Ini::parse(
            "# comment\n\
             tenant_id = default-tenant\n\
             app_id: app\n\
             \n\
             [example.com]\n\
             ; other comment\n\
             tenant_id = \"quoted tenant\"\n\
             homedir = /home/%d/%u   # inline\n\
             [DEFAULT]\n\
             shell = '/bin/zsh'\n",
        )
        .unwrap();

        let default = ini.default_section();
        assert_eq!(default.get("tenant_id"), Some("default-tenant"));
        assert_eq!(default.get("app_id"), Some("app"));
        assert_eq!(default.get("shell"), Some("/bin/zsh"));

        let domain = ini.section("example.com").unwrap();
        assert_eq!(domain.get("tenant_id"), Some("quoted tenant"));
        assert_eq!(domain.get("homedir"), Some("/home/%d/%u"));
        assert_eq!(domain.get("shell"), None);

        assert_eq!(ini.section_names().collect::<Vec<_>>(), ["example.com"]);
    }

    #[test]
    fn test_section_names_ignore_case() {
        let ini = Ini::parse("[Example.COM]\na = 1\n[example.com]\nb = 2\n").unwrap();
        let section = ini.section("example.com").unwrap();
        assert_eq!(section.get("a"), Some("1"));
        assert_eq!(section.get("b"), Some("2"));
        assert_eq!(ini.section_names().count(), 1);
    }

    #[test]
    fn test_last_value_wins() {
        let ini = Ini::parse("a = 1\na = 2\n").unwrap();
        assert_eq!(ini.default_section().get("a"), Some("2"));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            Ini::parse("[broken\n"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            Ini::parse("ok = 1\njust a line\n"),
            Err(ConfigError::Parse { line: 2, .. })
        ));
        assert!(Ini::parse(" = value\n").is_err());
    }
}
