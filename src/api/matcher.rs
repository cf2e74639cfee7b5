//! Purpose: Decide whether a target page satisfies a task's query.
//! Exports: `Matcher`, `MatchRequest`, `MatchOutcome`, `LocalMatcher`, `RemoteMatcher`,
//!          `MatcherProcess`, `find_available_port`.
//! Role: `LocalMatcher` scores pages in-process; `RemoteMatcher` speaks the external
//!       matcher-service protocol (`POST /match`, `GET /health`); `MatcherProcess`
//!       launches such a service as a child process and owns its lifetime.
//! Invariants: A page matches only when its score is strictly above the threshold.
//! Invariants: Matchers are blocking; async callers run them on the blocking pool.

use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::fetch::PageFetcher;
use crate::core::error::{Error, ErrorKind, parse_error_kind};
use crate::core::similarity::relevance;
use crate::core::text::page_text;

pub const DEFAULT_THRESHOLD: f64 = 0.6;
pub const HEALTH_RETRIES: u32 = 20;
pub const HEALTH_RETRY_DELAY: Duration = Duration::from_millis(500);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);
const REMOTE_MATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Serialize)]
pub struct MatchRequest<'a> {
    #[serde(rename = "id", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<&'a str>,
    pub url: &'a str,
    pub query: &'a str,
}

impl<'a> MatchRequest<'a> {
    pub fn new(url: &'a str, query: &'a str) -> Self {
        Self {
            task_id: None,
            url,
            query,
        }
    }

    pub fn with_task_id(mut self, task_id: &'a str) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

pub trait Matcher: Send + Sync {
    fn evaluate(&self, request: &MatchRequest<'_>) -> Result<MatchOutcome, Error>;

    /// Whether the matcher can currently serve requests.
    fn ready(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct LocalMatcher {
    fetcher: Arc<dyn PageFetcher>,
    threshold: f64,
}

impl LocalMatcher {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn score_html(&self, html: &str, query: &str) -> f64 {
        relevance(query, &page_text(html))
    }
}

impl Matcher for LocalMatcher {
    fn evaluate(&self, request: &MatchRequest<'_>) -> Result<MatchOutcome, Error> {
        if request.query.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("Missing URL or query"));
        }
        let html = self.fetcher.fetch(request.url)?;
        let score = self.score_html(&html, request.query);
        let matched = score > self.threshold;
        debug!(url = request.url, score, matched, "scored page");
        Ok(MatchOutcome {
            matched,
            score: Some(score),
        })
    }
}

#[derive(Clone)]
pub struct RemoteMatcher {
    base_url: Url,
    agent: ureq::Agent,
    health_agent: ureq::Agent,
}

impl RemoteMatcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let raw = base_url.into();
        let mut base_url = Url::parse(&raw).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid matcher url")
                .with_url(raw.clone())
                .with_source(err)
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("matcher url must use http or https")
                .with_url(raw));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            base_url,
            agent: ureq::AgentBuilder::new().timeout(REMOTE_MATCH_TIMEOUT).build(),
            health_agent: ureq::AgentBuilder::new().timeout(HEALTH_TIMEOUT).build(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Polls `GET /health` until it answers 200, sleeping `delay` between attempts.
    pub fn wait_until_healthy(&self, retries: u32, delay: Duration) -> Result<(), Error> {
        for attempt in 0..retries {
            if self.ready() {
                return Ok(());
            }
            if attempt + 1 < retries {
                sleep(delay);
            }
        }
        Err(Error::new(ErrorKind::Unavailable)
            .with_message("timed out waiting for matcher to become healthy")
            .with_url(self.base_url.as_str()))
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url.join(path).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to build matcher url")
                .with_source(err)
        })
    }
}

impl Matcher for RemoteMatcher {
    fn evaluate(&self, request: &MatchRequest<'_>) -> Result<MatchOutcome, Error> {
        let url = self.endpoint("match")?;
        let payload = serde_json::to_string(request).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode match request")
                .with_source(err)
        })?;
        let response = self
            .agent
            .request_url("POST", &url)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .send_string(&payload);
        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(matcher_error(code, &body).with_url(request.url));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(Error::new(ErrorKind::Unavailable)
                    .with_message("matcher request failed")
                    .with_url(self.base_url.as_str())
                    .with_source(err));
            }
        };
        let body = response.into_string().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read matcher response")
                .with_source(err)
        })?;
        serde_json::from_str(&body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("invalid matcher response json")
                .with_source(err)
        })
    }

    fn ready(&self) -> bool {
        let Ok(url) = self.endpoint("health") else {
            return false;
        };
        matches!(
            self.health_agent.request_url("GET", &url).call(),
            Ok(response) if response.status() == 200
        )
    }
}

// Accepts both `{"error": "text"}` and `{"error": {"kind": ..., "message": ...}}` bodies.
fn matcher_error(status: u16, body: &str) -> Error {
    let kind_from_status = match status {
        400 => ErrorKind::Usage,
        404 => ErrorKind::NotFound,
        502 => ErrorKind::Network,
        503 => ErrorKind::Unavailable,
        _ => ErrorKind::Internal,
    };
    let error = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("error").cloned());
    match error {
        Some(Value::String(message)) => Error::new(kind_from_status).with_message(message),
        Some(Value::Object(fields)) => {
            let kind = fields
                .get("kind")
                .and_then(Value::as_str)
                .map_or(kind_from_status, parse_error_kind);
            let message = fields
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("matcher error");
            Error::new(kind).with_message(message)
        }
        _ => Error::new(kind_from_status).with_message(format!("matcher returned status {status}")),
    }
}

/// An external matcher service running as a child process on a loopback port.
pub struct MatcherProcess {
    child: Child,
    port: u16,
    matcher: RemoteMatcher,
}

impl MatcherProcess {
    /// Starts `program args... --port=<free port>` and waits for its health endpoint.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, Error> {
        let port = find_available_port()?;
        let child = Command::new(program)
            .args(args)
            .arg(format!("--port={port}"))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| {
                Error::new(ErrorKind::Unavailable)
                    .with_message(format!("failed to start matcher command `{program}`"))
                    .with_source(err)
            })?;
        let matcher = RemoteMatcher::new(format!("http://127.0.0.1:{port}"))?;
        let mut process = Self {
            child,
            port,
            matcher,
        };
        process.wait_until_healthy(HEALTH_RETRIES, HEALTH_RETRY_DELAY)?;
        info!(port, program, "matcher process is healthy");
        Ok(process)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn matcher(&self) -> RemoteMatcher {
        self.matcher.clone()
    }

    fn wait_until_healthy(&mut self, retries: u32, delay: Duration) -> Result<(), Error> {
        for _ in 0..retries {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(Error::new(ErrorKind::Unavailable)
                    .with_message(format!("matcher process exited early ({status})")));
            }
            if self.matcher.ready() {
                return Ok(());
            }
            sleep(delay);
        }
        Err(Error::new(ErrorKind::Unavailable)
            .with_message(format!(
                "timed out waiting for matcher process on port {}",
                self.port
            ))
            .with_hint("Check that the matcher command accepts --port=<n> and serves GET /health."))
    }
}

impl Drop for MatcherProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            info!(port = self.port, "stopping matcher process");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

pub fn find_available_port() -> Result<u16, Error> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to reserve a loopback port")
            .with_source(err)
    })?;
    let addr = listener.local_addr().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read reserved port")
            .with_source(err)
    })?;
    Ok(addr.port())
}
