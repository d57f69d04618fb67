//! Authentication decision, independent of the PAM calling convention.

use std::path::PathBuf;

use aad_cache::{Cache, CacheError, CacheOptions};
use aad_config::ConfigLoader;
use aad_directory::{DirectoryAuth, Outcome, TokenClient};

pub const OFFLINE_EXPIRED_MESSAGE: &str =
    "Machine is offline and cached credentials expired. Please try again when the machine is online.";
pub const OFFLINE_DISABLED_MESSAGE: &str = "Machine is offline and offline authentication is \
    disabled. Please try again when the machine is online.";

/// Verifies credentials against the directory.
pub trait Authenticator {
    fn authenticate(&self, tenant_id: &str, app_id: &str, username: &str, password: &str)
        -> Outcome;
}

impl<C: TokenClient> Authenticator for DirectoryAuth<C> {
    fn authenticate(
        &self,
        tenant_id: &str,
        app_id: &str,
        username: &str,
        password: &str,
    ) -> Outcome {
        DirectoryAuth::authenticate(self, tenant_id, app_id, username, password)
    }
}

/// Messages shown to the user.
pub trait Conversation {
    fn info(&self, message: &str);
}

/// Result of [`PamFlow::authenticate`], mapped to PAM return codes by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PamResult {
    Success,
    AuthError,
    SystemError,
}

/// Inputs of one authentication.
pub struct PamFlow<A> {
    conf_path: PathBuf,
    loader: ConfigLoader,
    cache_options: CacheOptions,
    authenticator: A,
}

impl<A: Authenticator> PamFlow<A> {
    pub fn new(conf_path: impl Into<PathBuf>, authenticator: A) -> Self {
        Self {
            conf_path: conf_path.into(),
            loader: ConfigLoader::new(),
            cache_options: CacheOptions::new(),
            authenticator,
        }
    }

    pub fn config_loader(mut self, loader: ConfigLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Base options, the revalidation period is taken from the configuration.
    pub fn cache_options(mut self, options: CacheOptions) -> Self {
        self.cache_options = options;
        self
    }

    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        conversation: &dyn Conversation,
    ) -> PamResult {
        let login = username.to_lowercase();
        let domain = login.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();

        let config = match self.loader.load(&self.conf_path, domain) {
            Ok(config) => config,
            Err(err) => {
                log::error!("no valid configuration found: {err}");
                return PamResult::SystemError;
            }
        };

        let options = self
            .cache_options
            .clone()
            .offline_credentials_expiration(config.expiration_days());

        match self
            .authenticator
            .authenticate(&config.tenant_id, &config.app_id, &login, password)
        {
            Outcome::Denied => PamResult::AuthError,
            Outcome::Success => {
                let cache = match Cache::open(options) {
                    Ok(cache) => cache,
                    Err(err) => {
                        log::error!("unable to open cache: {err}");
                        return PamResult::SystemError;
                    }
                };
                if let Err(err) = cache.update(&login, password, &config.homedir, &config.shell) {
                    log::error!("unable to update cache for {login:?}: {err}");
                    return PamResult::AuthError;
                }
                PamResult::Success
            }
            Outcome::NoNetwork => {
                log::info!("no network, falling back to cached credentials for {login:?}");
                let cache = match Cache::open(options) {
                    Ok(cache) => cache,
                    Err(err) => {
                        log::error!("unable to open cache: {err}");
                        return PamResult::SystemError;
                    }
                };
                match cache.can_authenticate(&login, password) {
                    Ok(()) => PamResult::Success,
                    Err(err) => {
                        match err {
                            CacheError::CredentialsExpired(_) => {
                                conversation.info(OFFLINE_EXPIRED_MESSAGE)
                            }
                            CacheError::OfflineAuthDisabled => {
                                conversation.info(OFFLINE_DISABLED_MESSAGE)
                            }
                            _ => (),
                        }
                        log::error!("offline authentication of {login:?} failed: {err}");
                        PamResult::AuthError
                    }
                }
            }
        }
    }
}
