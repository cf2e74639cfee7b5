//! Purpose: Library crate behind the `sentinel` CLI and server.
//! Exports: `api` (task clients, matchers, observer) and `core` (task log, text, scoring, errors).
//! Role: Embeddable SDK: register a page + condition, let the observer record when it is met.
//! Invariants: All task log mutations go through `core::task_log::TaskLog` (locked, atomic).
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
mod task_paths;

pub use task_paths::{LOG_PATH_ENV, default_log_path};
