//! Purpose: Provide the HTTP/JSON server for Sentinel.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum server exposing the task log, on-demand checks, and the stateless `/match`
//!       endpoint, while the observer checks pending tasks in the background.
//! Invariants: Error envelopes are `{"error": {"kind", "message", ...}}`; kinds remain stable.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: `/match` and `/health` keep the external matcher-service contract, so one
//!             instance can serve as another's `--matcher-url`.

use axum::extract::{DefaultBodyLimit, Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentinel::api::{
    Error, ErrorKind, HttpFetcher, LocalMatcher, MatchRequest, Matcher, MatcherProcess, Observer,
    ObserverConfig, RegisterMode, RemoteMatcher, TaskClient,
};

const HEALTH_RETRIES: u32 = 20;
const HEALTH_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub log_path: PathBuf,
    pub interval: Duration,
    pub threshold: f64,
    pub max_concurrent_checks: usize,
    pub matcher_url: Option<String>,
    pub matcher_cmd: Option<String>,
    pub matcher_args: Vec<String>,
    pub allow_non_loopback: bool,
    pub max_body_bytes: u64,
    pub observe: bool,
}

struct AppState {
    observer: Observer,
    matcher: Arc<dyn Matcher>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let (matcher, _matcher_process) = build_matcher(&config).await?;
    let client = TaskClient::new().with_log_path(&config.log_path);
    let observer = Observer::new(
        client,
        Arc::clone(&matcher),
        ObserverConfig {
            interval: config.interval,
            max_concurrent_checks: config.max_concurrent_checks,
        },
    )?;
    if config.observe {
        observer.start()?;
    } else {
        observer.client().ensure_log()?;
    }

    let state = Arc::new(AppState {
        observer: observer.clone(),
        matcher,
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health))
        .route("/match", post(match_page))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/remove", post(remove_matching))
        .route("/api/tasks/:id", get(get_task).delete(delete_task))
        .route("/api/tasks/:id/complete", post(complete_task))
        .route("/api/tasks/:id/check", post(check_task))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    info!(bind = %config.bind, log = %config.log_path.display(), "sentinel listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                }),
                Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
            }
        }
    };
    observer.shutdown();
    result
}

async fn build_matcher(
    config: &ServeConfig,
) -> Result<(Arc<dyn Matcher>, Option<MatcherProcess>), Error> {
    if let Some(program) = config.matcher_cmd.clone() {
        let args = config.matcher_args.clone();
        let process = tokio::task::spawn_blocking(move || MatcherProcess::spawn(&program, &args))
            .await
            .map_err(join_error)??;
        let matcher: Arc<dyn Matcher> = Arc::new(process.matcher());
        return Ok((matcher, Some(process)));
    }
    if let Some(url) = config.matcher_url.as_deref() {
        let remote = RemoteMatcher::new(url)?;
        let waiting = remote.clone();
        tokio::task::spawn_blocking(move || {
            waiting.wait_until_healthy(HEALTH_RETRIES, HEALTH_RETRY_DELAY)
        })
        .await
        .map_err(join_error)??;
        info!(matcher = %remote.base_url(), "remote matcher is healthy");
        return Ok((Arc::new(remote), None));
    }
    let local = LocalMatcher::new(Arc::new(HttpFetcher::new())).with_threshold(config.threshold);
    Ok((Arc::new(local), None))
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.interval.is_zero() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--interval-secs must be greater than zero")
            .with_hint("Use a positive value like 30."));
    }

    if config.max_concurrent_checks == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-concurrent-checks must be greater than zero")
            .with_hint("Use a positive value like 4."));
    }

    if !(0.0..=1.0).contains(&config.threshold) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--threshold must be between 0 and 1")
            .with_hint("Use a value like 0.6."));
    }

    if config.matcher_url.is_some() && config.matcher_cmd.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--matcher-url cannot be combined with --matcher-cmd")
            .with_hint("Point at a running matcher or let sentinel start one, not both."));
    }

    if config.matcher_cmd.is_none() && !config.matcher_args.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--matcher-arg requires --matcher-cmd"));
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    target: Option<String>,
    query: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    complete: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RemoveMatchingRequest {
    target: String,
    query: String,
}

#[derive(Debug, Deserialize)]
struct MatchPageRequest {
    url: Option<String>,
    query: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let matcher = Arc::clone(&state.matcher);
    let ready = tokio::task::spawn_blocking(move || matcher.ready())
        .await
        .unwrap_or(false);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready }))).into_response()
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Response {
    let observer = state.observer.clone();
    match blocking(move || observer.client().list()).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => error_response(err),
    }
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateTaskRequest>,
) -> Response {
    let (Some(target), Some(query)) = (payload.target, payload.query) else {
        return error_response(
            Error::new(ErrorKind::Usage).with_message("request requires target and query"),
        );
    };
    let mode = if payload.force {
        RegisterMode::Force
    } else {
        RegisterMode::SkipDuplicates
    };
    let observer = state.observer.clone();
    match blocking(move || observer.register(target, query, mode)).await {
        Ok(registered) => {
            let created = registered.is_new();
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            let body = json!({ "task": registered.task(), "created": created });
            (status, Json(body)).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn get_task(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    let observer = state.observer.clone();
    match blocking(move || observer.client().get(&id)).await {
        Ok(task) => Json(json!({ "task": task })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let observer = state.observer.clone();
    match blocking(move || observer.remove(&id)).await {
        Ok(task) => Json(json!({ "task": task })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn remove_matching(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RemoveMatchingRequest>,
) -> Response {
    let observer = state.observer.clone();
    let removed = blocking(move || {
        observer
            .client()
            .remove_matching(&payload.target, &payload.query)
    })
    .await;
    match removed {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn complete_task(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(payload): Json<CompleteRequest>,
) -> Response {
    let complete = payload.complete.unwrap_or(true);
    let observer = state.observer.clone();
    match blocking(move || observer.set_complete(&id, complete)).await {
        Ok(task) => Json(json!({ "task": task })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn check_task(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.observer.check_now(&id).await {
        Ok(report) => Json(json!({
            "task": report.task,
            "matched": report.outcome.matched,
            "score": report.outcome.score,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn match_page(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MatchPageRequest>,
) -> Response {
    let (Some(url), Some(query)) = (payload.url, payload.query) else {
        return error_response(Error::new(ErrorKind::Usage).with_message("Missing URL or query"));
    };
    if url.is_empty() || query.is_empty() {
        return error_response(Error::new(ErrorKind::Usage).with_message("Missing URL or query"));
    }
    let matcher = Arc::clone(&state.matcher);
    let task_id = payload.id;
    let result = tokio::task::spawn_blocking(move || {
        if !matcher.ready() {
            return Err(Error::new(ErrorKind::Unavailable).with_message("Matcher not ready"));
        }
        let mut request = MatchRequest::new(&url, &query);
        if let Some(task_id) = task_id.as_deref() {
            request = request.with_task_id(task_id);
        }
        matcher.evaluate(&request)
    })
    .await
    .map_err(join_error)
    .and_then(|result| result);

    match result {
        Ok(outcome) => {
            info!(matched = outcome.matched, score = ?outcome.score, "match request served");
            Json(json!({ "matched": outcome.matched, "score": outcome.score })).into_response()
        }
        Err(err) => error_response(err),
    }
}

/// Runs task log work on the blocking pool; the log takes file locks.
async fn blocking<T, F>(job: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job).await.map_err(join_error)?
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("background task failed")
        .with_source(err)
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Network => StatusCode::BAD_GATEWAY,
        ErrorKind::Corrupt | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            path: err.path().map(|path| path.to_string_lossy().to_string()),
            task_id: err.task_id().map(str::to_string),
            url: err.url().map(str::to_string),
        },
    };
    (status, Json(body)).into_response()
}
