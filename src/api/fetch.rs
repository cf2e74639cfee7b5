//! Purpose: Fetch target pages over HTTP for matching.
//! Exports: `PageFetcher`, `HttpFetcher`, `DEFAULT_FETCH_TIMEOUT`.
//! Role: Seam between matchers and the network; tests substitute canned pages.
//! Invariants: Non-2xx responses and transport failures surface as `ErrorKind::Network`.
//! Invariants: Only absolute http/https URLs are fetched.

use std::time::Duration;

use crate::core::error::{Error, ErrorKind};
use crate::core::task::validate_target;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(8);

pub trait PageFetcher: Send + Sync {
    /// Returns the response body of `url` as text.
    fn fetch(&self, url: &str) -> Result<String, Error>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("sentinel/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<String, Error> {
        let parsed = validate_target(url)?;
        let response = match self.agent.request_url("GET", &parsed).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(Error::new(ErrorKind::Network)
                    .with_message(format!("target returned status {code}"))
                    .with_url(url));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(Error::new(ErrorKind::Network)
                    .with_message("failed to fetch target")
                    .with_url(url)
                    .with_source(err));
            }
        };
        response.into_string().map_err(|err| {
            Error::new(ErrorKind::Network)
                .with_message("failed to read target body")
                .with_url(url)
                .with_source(err)
        })
    }
}
