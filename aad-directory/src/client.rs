use std::time::Duration;

/// Error type returned by failed HTTP requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Non-ureq HTTP error.
    #[error("HTTP error - {0}")]
    Http(#[from] http::Error),

    /// Error returned by ureq crate.
    // boxed due to https://github.com/algesten/ureq/issues/296
    #[error("ureq request failed - {0}")]
    Ureq(#[from] Box<ureq::Error>),

    /// Other error.
    #[error("Other error: {0}")]
    Other(String),
}

/// Transport used to post the token request. Implemented by [`HttpClient`], replaceable in
/// tests.
pub trait TokenClient {
    /// POST an `application/x-www-form-urlencoded` body. Error statuses are returned as
    /// responses, `Err` is reserved for transport failures.
    fn post_form(&self, url: &str, body: String) -> Result<http::Response<String>, Error>;
}

/// Blocking HTTPS client with native-tls.
pub struct HttpClient {
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn agent(&self) -> ureq::Agent {
        ureq::Agent::config_builder()
            .tls_config(
                ureq::tls::TlsConfig::builder()
                    .provider(ureq::tls::TlsProvider::NativeTls)
                    .root_certs(ureq::tls::RootCerts::PlatformVerifier)
                    .build(),
            )
            .user_agent(concat!("aad-auth/", env!("CARGO_PKG_VERSION")))
            .timeout_global(Some(self.timeout))
            .http_status_as_error(false)
            .build()
            .into()
    }
}

impl TokenClient for HttpClient {
    fn post_form(&self, url: &str, body: String) -> Result<http::Response<String>, Error> {
        let agent = self.agent();
        let req = http::Request::post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)?;

        let res = agent.run(req).map_err(Box::new)?;
        let (parts, mut body) = res.into_parts();
        let body = body.read_to_string().map_err(Box::new)?;
        Ok(http::Response::from_parts(parts, body))
    }
}
