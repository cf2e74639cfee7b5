//! Purpose: HTTP client for a running `sentinel serve` instance.
//! Exports: `RemoteTaskClient`.
//! Role: Mirrors `TaskClient` operations remotely, plus on-demand checks and page matching.
//! Invariants: Base URLs are origin-only (`http[s]://host:port/`).
//! Invariants: Server error envelopes decode back into the same `ErrorKind`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::matcher::MatchOutcome;
use super::observer::CheckReport;
use crate::core::error::{Error, ErrorKind, parse_error_kind};
use crate::core::task::Task;
use crate::core::task_log::{RegisterMode, Registered};

type ApiResult<T> = Result<T, Error>;

#[derive(Clone)]
pub struct RemoteTaskClient {
    inner: Arc<RemoteClientInner>,
}

struct RemoteClientInner {
    base_url: Url,
    agent: ureq::Agent,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    target: &'a str,
    query: &'a str,
    force: bool,
}

#[derive(Serialize)]
struct CompleteRequest {
    complete: bool,
}

#[derive(Serialize)]
struct RemoveMatchingRequest<'a> {
    target: &'a str,
    query: &'a str,
}

#[derive(Serialize)]
struct MatchPageRequest<'a> {
    url: &'a str,
    query: &'a str,
}

#[derive(Deserialize)]
struct TaskEnvelope {
    task: Task,
}

#[derive(Deserialize)]
struct RegisterEnvelope {
    task: Task,
    created: bool,
}

#[derive(Deserialize)]
struct RemovedEnvelope {
    removed: usize,
}

#[derive(Deserialize)]
struct CheckEnvelope {
    task: Task,
    matched: bool,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    path: Option<String>,
    task_id: Option<String>,
    url: Option<String>,
}

impl RemoteTaskClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new().build();
        Ok(Self {
            inner: Arc::new(RemoteClientInner { base_url, agent }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn healthy(&self) -> bool {
        let Ok(url) = build_url(&self.inner.base_url, &["healthz"]) else {
            return false;
        };
        self.inner.agent.request_url("GET", &url).call().is_ok()
    }

    pub fn list(&self) -> ApiResult<Vec<Task>> {
        let url = build_url(&self.inner.base_url, &["api", "tasks"])?;
        self.request_json("GET", &url, &Value::Null)
    }

    pub fn pending(&self) -> ApiResult<Vec<Task>> {
        let mut tasks = self.list()?;
        tasks.retain(|task| !task.complete);
        Ok(tasks)
    }

    pub fn register(&self, target: &str, query: &str, mode: RegisterMode) -> ApiResult<Registered> {
        let url = build_url(&self.inner.base_url, &["api", "tasks"])?;
        let body = RegisterRequest {
            target,
            query,
            force: mode == RegisterMode::Force,
        };
        let envelope: RegisterEnvelope = self.request_json("POST", &url, &body)?;
        Ok(if envelope.created {
            Registered::Added(envelope.task)
        } else {
            Registered::Existing(envelope.task)
        })
    }

    pub fn get(&self, id: &str) -> ApiResult<Task> {
        let url = build_url(&self.inner.base_url, &["api", "tasks", id])?;
        let envelope: TaskEnvelope = self.request_json("GET", &url, &Value::Null)?;
        Ok(envelope.task)
    }

    pub fn remove(&self, id: &str) -> ApiResult<Task> {
        let url = build_url(&self.inner.base_url, &["api", "tasks", id])?;
        let envelope: TaskEnvelope = self.request_json("DELETE", &url, &Value::Null)?;
        Ok(envelope.task)
    }

    pub fn remove_matching(&self, target: &str, query: &str) -> ApiResult<usize> {
        let url = build_url(&self.inner.base_url, &["api", "tasks", "remove"])?;
        let envelope: RemovedEnvelope =
            self.request_json("POST", &url, &RemoveMatchingRequest { target, query })?;
        Ok(envelope.removed)
    }

    pub fn set_complete(&self, id: &str, complete: bool) -> ApiResult<Task> {
        let url = build_url(&self.inner.base_url, &["api", "tasks", id, "complete"])?;
        let envelope: TaskEnvelope =
            self.request_json("POST", &url, &CompleteRequest { complete })?;
        Ok(envelope.task)
    }

    pub fn check(&self, id: &str) -> ApiResult<CheckReport> {
        let url = build_url(&self.inner.base_url, &["api", "tasks", id, "check"])?;
        let envelope: CheckEnvelope = self.request_json("POST", &url, &Value::Null)?;
        Ok(CheckReport {
            task: envelope.task,
            outcome: MatchOutcome {
                matched: envelope.matched,
                score: envelope.score,
            },
        })
    }

    pub fn match_page(&self, page_url: &str, query: &str) -> ApiResult<MatchOutcome> {
        let url = build_url(&self.inner.base_url, &["match"])?;
        self.request_json("POST", &url, &MatchPageRequest { url: page_url, query })
    }

    fn request_json<T, R>(&self, method: &str, url: &Url, body: &T) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = self
            .inner
            .agent
            .request_url(method, url)
            .set("Accept", "application/json");
        let response = if method == "GET" || method == "DELETE" {
            request.call()
        } else {
            let payload = serde_json::to_string(body).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode request json")
                    .with_source(err)
            })?;
            request
                .set("Content-Type", "application/json")
                .send_string(&payload)
        };

        match response {
            Ok(resp) => read_json_response(resp),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Unavailable)
                .with_message("request to sentinel server failed")
                .with_url(url.as_str())
                .with_hint("Check that `sentinel serve` is running and --server points at it.")
                .with_source(err)),
        }
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid server url")
            .with_url(raw.clone())
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("server url must use http or https scheme")
            .with_url(raw));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("server url must not include a path")
            .with_url(raw));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("server url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return error_from_remote(envelope.error);
    }
    Error::new(error_kind_from_status(status)).with_message(format!("server error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let mut err = Error::new(parse_error_kind(&remote.kind));
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(path) = remote.path {
        err = err.with_path(path);
    }
    if let Some(task_id) = remote.task_id {
        err = err.with_task_id(task_id);
    }
    if let Some(url) = remote.url {
        err = err.with_url(url);
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 | 422 => ErrorKind::Usage,
        403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        423 => ErrorKind::Busy,
        502 => ErrorKind::Network,
        503 => ErrorKind::Unavailable,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}
