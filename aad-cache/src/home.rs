//! Home directory pattern expansion.
//!
//! | token | replacement |
//! |-------|-------------|
//! | `%f`  | full login |
//! | `%u`  | part of the login before `@` |
//! | `%U`  | uid |
//! | `%d`  | part of the login after `@` |
//! | `%l`  | first character of the part before `@` |
//! | `%%`  | a literal `%` |

use crate::CacheError;

pub fn expand(pattern: &str, login: &str, uid: u32) -> Result<String, CacheError> {
    let (user, domain) = login.split_once('@').unwrap_or((login, ""));

    let error = |reason: String| CacheError::HomePattern {
        pattern: pattern.to_string(),
        reason,
    };

    let mut home = String::with_capacity(pattern.len() + login.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            home.push(c);
            continue;
        }
        match chars.next() {
            Some('f') => home.push_str(login),
            Some('u') => home.push_str(user),
            Some('U') => home.push_str(&uid.to_string()),
            Some('d') => home.push_str(domain),
            Some('l') => {
                if let Some(first) = user.chars().next() {
                    home.push(first);
                }
            }
            Some('%') => home.push('%'),
            Some(other) => return Err(error(format!("unknown token '%{other}'"))),
            None => return Err(error("trailing '%'".to_string())),
        }
    }

    Ok(home)
}
