//! Purpose: Resolve the task log location shared by the CLI, server, and SDK client.
//! Exports: `default_log_path`, `LOG_PATH_ENV`.
//! Invariants: `$SENTINEL_TASK_LOG` wins when set and non-empty.
//! Invariants: Otherwise the log is `.task_log.json` in the working directory.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::core::task_log::DEFAULT_LOG_FILE;

pub const LOG_PATH_ENV: &str = "SENTINEL_TASK_LOG";

pub fn default_log_path() -> PathBuf {
    log_path_from(std::env::var_os(LOG_PATH_ENV))
}

fn log_path_from(env_value: Option<OsString>) -> PathBuf {
    match env_value {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_LOG_FILE),
    }
}

#[cfg(test)]
mod tests {
    use super::log_path_from;
    use std::ffi::OsString;
    use std::path::PathBuf;

    #[test]
    fn falls_back_to_working_directory_log() {
        assert_eq!(log_path_from(None), PathBuf::from(".task_log.json"));
        assert_eq!(
            log_path_from(Some(OsString::new())),
            PathBuf::from(".task_log.json")
        );
    }

    #[test]
    fn env_value_overrides_default() {
        assert_eq!(
            log_path_from(Some(OsString::from("/var/lib/sentinel/tasks.json"))),
            PathBuf::from("/var/lib/sentinel/tasks.json")
        );
    }
}
