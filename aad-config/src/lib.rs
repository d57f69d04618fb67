//! Configuration of the Azure AD authentication modules.
//!
//! The configuration file is an INI file. Keys at the top of the file (or in a `[DEFAULT]`
//! section) apply to every user, sections named after a domain override them for logins of that
//! domain:
//!
//! ```ini
//! tenant_id = 9c5d6d88-0000-0000-0000-000000000000
//! app_id = 2e0e0a4a-0000-0000-0000-000000000000
//! offline_credentials_expiration = 90
//!
//! [example.com]
//! homedir = /home/%d/%u
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod ini;
use ini::{Ini, Section};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/aad.conf";

/// Source of the default home directory and shell.
pub const ADDUSER_CONF_PATH: &str = "/etc/adduser.conf";

pub const DEFAULT_HOME_PATTERN: &str = "/home/%u";
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Revalidation period when `offline_credentials_expiration` is not set, in days.
pub const DEFAULT_OFFLINE_CREDENTIALS_EXPIRATION: i32 = 90;

/// Seed for new configuration files.
pub const CONFIG_TEMPLATE: &str = r#"### Required: Azure AD tenant and application ids
# tenant_id = <TENANT_ID>
# app_id = <APP_ID>

### Number of days a user may log in with cached credentials
### without contacting Azure AD. 0 means forever, a negative value
### disables offline logins.
# offline_credentials_expiration = 90

### Home directory pattern for new users
###   %f full login, %u user part of the login, %U uid,
###   %d domain, %l first letter of the user part, %% literal '%'
# homedir = /home/%u

### Login shell for new users
# shell = /bin/bash

### Per domain overrides
# [example.com]
# tenant_id = <OTHER_TENANT_ID>
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not open {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("missing required '{0}' entry in configuration file")]
    MissingKey(&'static str),

    #[error("could not load valid configuration from {path:?}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },
}

/// Configuration for one domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AadConfig {
    pub tenant_id: String,
    pub app_id: String,
    /// `None` if unset or invalid.
    pub offline_credentials_expiration: Option<i32>,
    pub homedir: String,
    pub shell: String,
}

impl AadConfig {
    /// Revalidation period in days, with the default applied.
    pub fn expiration_days(&self) -> i32 {
        self.offline_credentials_expiration
            .unwrap_or(DEFAULT_OFFLINE_CREDENTIALS_EXPIRATION)
    }

    /// Render as INI, as printed by `aad-cli config print`.
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "tenant_id = {}", self.tenant_id);
        let _ = writeln!(out, "app_id = {}", self.app_id);
        if let Some(days) = self.offline_credentials_expiration {
            let _ = writeln!(out, "offline_credentials_expiration = {days}");
        }
        let _ = writeln!(out, "homedir = {}", self.homedir);
        let _ = writeln!(out, "shell = {}", self.shell);
        out
    }

    fn apply(&mut self, section: &Section) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = section.get(key).filter(|v| !v.is_empty()) {
                *target = value.to_string();
            }
        };
        set(&mut self.tenant_id, "tenant_id");
        set(&mut self.app_id, "app_id");
        set(&mut self.homedir, "homedir");
        set(&mut self.shell, "shell");

        if let Some(value) = section
            .get("offline_credentials_expiration")
            .filter(|v| !v.is_empty())
        {
            match value.parse::<i32>() {
                Ok(days) => self.offline_credentials_expiration = Some(days),
                Err(err) => {
                    log::warn!("invalid offline_credentials_expiration {value:?}: {err}");
                    self.offline_credentials_expiration = None;
                }
            }
        }
    }
}

/// Loader with overridable system paths.
#[derive(Clone, Debug)]
pub struct ConfigLoader {
    adduser_conf: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            adduser_conf: Some(PathBuf::from(ADDUSER_CONF_PATH)),
        }
    }

    /// Use another adduser.conf, or none at all.
    pub fn adduser_conf(mut self, path: Option<PathBuf>) -> Self {
        self.adduser_conf = path;
        self
    }

    /// Load the configuration for `domain` from `path`.
    pub fn load(&self, path: &Path, domain: &str) -> Result<AadConfig, ConfigError> {
        log::debug!("loading configuration from {path:?}");
        let ini = read_ini(path)?;
        self.load_from(&ini, domain).map_err(|err| ConfigError::Invalid {
            path: path.to_owned(),
            source: Box::new(err),
        })
    }

    fn load_from(&self, ini: &Ini, domain: &str) -> Result<AadConfig, ConfigError> {
        let (homedir, shell) = self.system_defaults();
        let mut config = AadConfig {
            tenant_id: String::new(),
            app_id: String::new(),
            offline_credentials_expiration: None,
            homedir,
            shell,
        };

        config.apply(ini.default_section());
        if !domain.is_empty() {
            if let Some(section) = ini.section(domain) {
                config.apply(section);
            }
        }

        if config.tenant_id.is_empty() {
            return Err(ConfigError::MissingKey("tenant_id"));
        }
        if config.app_id.is_empty() {
            return Err(ConfigError::MissingKey("app_id"));
        }

        Ok(config)
    }

    /// Check that every domain section, or the default section if there is none, yields a
    /// complete configuration.
    pub fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let ini = read_ini(path)?;
        let mut domains: Vec<&str> = ini.section_names().collect();
        if domains.is_empty() {
            domains.push("");
        }

        for domain in domains {
            self.load_from(&ini, domain)
                .map_err(|err| ConfigError::Invalid {
                    path: path.to_owned(),
                    source: Box::new(err),
                })?;
        }
        Ok(())
    }

    /// Defaults for home pattern and shell, from adduser.conf if available.
    fn system_defaults(&self) -> (String, String) {
        let mut homedir = DEFAULT_HOME_PATTERN.to_string();
        let mut shell = DEFAULT_SHELL.to_string();

        let Some(path) = &self.adduser_conf else {
            return (homedir, shell);
        };
        let ini = match read_ini(path) {
            Ok(ini) => ini,
            Err(err) => {
                log::debug!("using built-in defaults for homedir and shell: {err}");
                return (homedir, shell);
            }
        };

        let section = ini.default_section();
        if let Some(dhome) = section.get("DHOME").filter(|v| !v.is_empty()) {
            homedir = format!("{}/%u", dhome.trim_end_matches('/'));
        }
        if let Some(dshell) = section.get("DSHELL").filter(|v| !v.is_empty()) {
            shell = dshell.to_string();
        }

        (homedir, shell)
    }
}

/// Load the configuration for `domain` using the system's adduser.conf.
pub fn load(path: &Path, domain: &str) -> Result<AadConfig, ConfigError> {
    ConfigLoader::new().load(path, domain)
}

/// Validate a configuration file using the system's adduser.conf.
pub fn validate(path: &Path) -> Result<(), ConfigError> {
    ConfigLoader::new().validate(path)
}

fn read_ini(path: &Path) -> Result<Ini, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ini::parse(&text)
}
