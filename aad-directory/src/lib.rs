//! Verify a username and password against Azure AD.
//!
//! The check requests a token with the resource owner password grant. Only the outcome matters,
//! the token itself is discarded.

use std::time::Duration;

use serde::Deserialize;

mod client;
pub use client::{Error, HttpClient, TokenClient};

/// Base URL of the Microsoft identity platform.
pub const ENDPOINT: &str = "https://login.microsoftonline.com";

const INVALID_CREDENTIALS: i64 = 50126;
const REQUIRES_MFA: i64 = 50076;
const NO_SUCH_USER: i64 = 50034;
const NO_CONSENT: i64 = 65001;
const NO_PUBLIC_CLIENT_FLOWS: i64 = 7000218;

const SCOPES: &str = "openid profile offline_access";

/// Default for the whole request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of an authentication attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The directory accepted the credentials.
    Success,
    /// The directory rejected the credentials.
    Denied,
    /// The directory could not be reached, the cache may be used instead.
    NoNetwork,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error_codes: Vec<i64>,
}

/// Azure AD authenticator.
pub struct DirectoryAuth<C = HttpClient> {
    client: C,
    endpoint: String,
}

impl DirectoryAuth<HttpClient> {
    pub fn new() -> Self {
        Self::with_client(HttpClient::new(DEFAULT_TIMEOUT))
    }
}

impl Default for DirectoryAuth<HttpClient> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: TokenClient> DirectoryAuth<C> {
    pub fn with_client(client: C) -> Self {
        Self {
            client,
            endpoint: ENDPOINT.to_string(),
        }
    }

    /// Use another identity platform endpoint.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn authenticate(
        &self,
        tenant_id: &str,
        app_id: &str,
        username: &str,
        password: &str,
    ) -> Outcome {
        let authority = format!("{}/{}", self.endpoint.trim_end_matches('/'), tenant_id);
        log::debug!("connecting to {authority:?} with client id {app_id:?} for user {username:?}");

        let url = format!("{authority}/oauth2/v2.0/token");
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "password")
            .append_pair("client_id", app_id)
            .append_pair("scope", SCOPES)
            .append_pair("username", username)
            .append_pair("password", password)
            .finish();

        let response = match self.client.post_form(&url, body) {
            Ok(response) => response,
            Err(err) => {
                log::debug!("acquiring token failed: {err}");
                return Outcome::NoNetwork;
            }
        };

        if response.status().is_success() {
            log::debug!("authentication successful with user/password");
            return Outcome::Success;
        }

        let error: ErrorResponse = match serde_json::from_str(response.body()) {
            Ok(error) => error,
            Err(err) => {
                log::error!(
                    "invalid server response ({}), not a json object: {err}",
                    response.status()
                );
                return Outcome::Denied;
            }
        };

        classify(&error.error_codes, &authority, app_id)
    }
}

/// The first known code decides.
fn classify(codes: &[i64], authority: &str, app_id: &str) -> Outcome {
    for &code in codes {
        match code {
            INVALID_CREDENTIALS => {
                log::debug!("got response: invalid credentials");
                return Outcome::Denied;
            }
            NO_SUCH_USER => {
                log::debug!("got response: user doesn't exist");
                return Outcome::Denied;
            }
            REQUIRES_MFA => {
                log::debug!("authentication successful even if requiring MFA");
                return Outcome::Success;
            }
            NO_CONSENT => {
                log::error!(
                    "Azure AD application requires consent, either from tenant, or from user. \
                     If you're a tenant's administrator, go to: {authority}/adminconsent?client_id={app_id}"
                );
                return Outcome::Denied;
            }
            NO_PUBLIC_CLIENT_FLOWS => {
                log::error!(
                    "Azure AD application requires enabling 'Allow public client flows'. \
                     https://learn.microsoft.com/en-us/azure/active-directory/develop/scenario-desktop-app-registration#redirect-uris"
                );
                return Outcome::Denied;
            }
            _ => (),
        }
    }

    log::error!("unknown error code(s) from server: {codes:?}");
    for code in codes {
        log::debug!("- error code {code}: {ENDPOINT}/error?code={code}");
    }
    Outcome::Denied
}
