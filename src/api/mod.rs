//! Purpose: Define the public Rust API boundary for Sentinel.
//! Exports: Task clients, matchers, page fetching, and the observer.
//! Role: Public surface used by the CLI, the server, and embedding applications.
//! Invariants: Storage details stay behind `TaskClient`; callers never touch the log file directly.

mod client;
mod fetch;
mod matcher;
mod observer;
mod remote;
#[cfg(test)]
mod test_support;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::task::Task;
pub use crate::core::task_log::{RegisterMode, Registered};
pub use client::{ApiResult, TaskClient};
pub use fetch::{DEFAULT_FETCH_TIMEOUT, HttpFetcher, PageFetcher};
pub use matcher::{
    DEFAULT_THRESHOLD, LocalMatcher, MatchOutcome, MatchRequest, Matcher, MatcherProcess,
    RemoteMatcher, find_available_port,
};
pub use observer::{
    CheckReport, DEFAULT_CHECK_INTERVAL, DEFAULT_MAX_CONCURRENT_CHECKS, Observer, ObserverConfig,
    check_task,
};
pub use remote::RemoteTaskClient;
