//! Logging setup shared by the PAM and NSS modules and the CLI.
//!
//! The libraries log through the `log` facade, which is forwarded into a `tracing` subscriber
//! built here.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_log::{AsLog, LogTracer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry};

pub use tracing_subscriber::filter::LevelFilter;

/// Environment variable overriding the log level.
pub const LOG_ENV: &str = "AAD_AUTH_LOG";

static INITIALIZED: AtomicBool = AtomicBool::new(false);

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Where log records go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    /// The journal, or stderr on hosts without one.
    Journald,
    Stderr,
}

impl Target {
    /// Returns the layer and whether it had to fall back to stderr.
    fn layer(self, level: LevelFilter) -> (BoxedLayer, bool) {
        match self {
            Target::Journald => match tracing_journald::layer() {
                Ok(layer) => (layer.with_filter(level).boxed(), false),
                Err(_) => (stderr_layer(level), true),
            },
            Target::Stderr => (stderr_layer(level), false),
        }
    }
}

fn stderr_layer(level: LevelFilter) -> BoxedLayer {
    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_filter(level)
        .boxed()
}

/// Parse a level name as accepted in [`LOG_ENV`]. Empty means unset.
fn parse_level(value: &str) -> Result<Option<LevelFilter>, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<LevelFilter>()
        .map(Some)
        .map_err(|_| format!("invalid log level {value:?} in {LOG_ENV}"))
}

/// Builder for the global logger.
///
/// Nothing is opened before [`Logger::init`], and only the first `init` in a process does any
/// work, so the modules can call this on every entry.
///
/// ```
/// # use aad_log::{Logger, LevelFilter};
/// # fn func() -> Result<(), anyhow::Error> {
/// Logger::from_env(aad_log::LOG_ENV, LevelFilter::INFO)
///     .stderr()
///     .init()?;
/// # Ok(())
/// # }
/// # func().expect("failed to init logger");
/// ```
pub struct Logger {
    level: LevelFilter,
    targets: Vec<Target>,
    // reported once the logger is installed
    env_error: Option<String>,
}

impl Logger {
    /// Use the level from `env_var` if it is set and valid, `default_level` otherwise.
    pub fn from_env(env_var: &str, default_level: LevelFilter) -> Logger {
        let parsed = match std::env::var(env_var) {
            Ok(value) => parse_level(&value),
            Err(_) => Ok(None),
        };
        let (level, env_error) = match parsed {
            Ok(level) => (level.unwrap_or(default_level), None),
            Err(err) => (default_level, Some(err)),
        };

        Logger {
            level,
            targets: Vec::new(),
            env_error,
        }
    }

    /// Raise the level to at least `level`.
    pub fn at_least(mut self, level: LevelFilter) -> Logger {
        self.level = self.level.max(level);
        self
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Log to journald, or stderr if the journal cannot be opened.
    pub fn journald(mut self) -> Logger {
        self.targets.push(Target::Journald);
        self
    }

    /// Log to stderr with level but without timestamp.
    pub fn stderr(mut self) -> Logger {
        self.targets.push(Target::Stderr);
        self
    }

    /// Install the logger and forward `log` records to it.
    pub fn init(self) -> Result<(), anyhow::Error> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut journal_missing = false;
        let layers: Vec<BoxedLayer> = self
            .targets
            .iter()
            .map(|target| {
                let (layer, fallback) = target.layer(self.level);
                journal_missing |= fallback;
                layer
            })
            .collect();

        let registry = tracing_subscriber::registry().with(layers);
        tracing::subscriber::set_global_default(registry)?;
        LogTracer::init_with_filter(self.level.as_log())?;

        if journal_missing {
            log::debug!("journal not available, logging to stderr");
        }
        if let Some(err) = self.env_error {
            log::warn!("{err}");
        }
        Ok(())
    }
}
