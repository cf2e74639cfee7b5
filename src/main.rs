//! Purpose: `sentinel` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Successful commands print exactly one JSON value on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Task mutations go through `api::TaskClient` or `api::RemoteTaskClient`.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod command_dispatch;
mod serve;

use sentinel::api::{
    CheckReport, DEFAULT_THRESHOLD, Error, ErrorKind, MatchOutcome, RegisterMode, Registered,
    RemoteTaskClient, Task, TaskClient, to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(message)
                    .with_hint(hint));
            }
        },
    };

    let log_path = cli.log.unwrap_or_else(sentinel::default_log_path);
    command_dispatch::dispatch_command(cli.command, log_path, cli.server)
        .map_err(add_corrupt_hint)
        .map_err(add_unavailable_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let replacement = arg.to_str().and_then(|value| match value {
                "---help" => Some("--help"),
                "---version" => Some("--version"),
                _ => None,
            });
            replacement.map(OsString::from).unwrap_or_else(|| arg)
        })
        .collect()
}

#[derive(Parser)]
#[command(
    name = "sentinel",
    version,
    about = "Watch web pages until they mention what you are waiting for",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Tasks pair a page URL with a query. Output is JSON.

Mental model:
  - `add` registers a task in the task log
  - `serve` checks pending tasks on an interval until each one matches
  - `check` runs one check right now
"#,
    after_help = r#"EXAMPLES
  $ sentinel add https://example.com/releases "version 2.0 released"
  $ sentinel list --pending
  $ sentinel serve --interval-secs 60

LEARN MORE
  $ sentinel <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Task log file (default: $SENTINEL_TASK_LOG or ./.task_log.json)",
        value_hint = ValueHint::FilePath
    )]
    log: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Talk to a running `sentinel serve` instead of the local task log",
        value_hint = ValueHint::Url
    )]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Register a task",
        long_about = r#"Register a task that watches TARGET until its text matches QUERY.

Registering the same target and query twice returns the existing task
unless --force is given."#,
        after_help = r#"EXAMPLES
  $ sentinel add https://example.com "tickets on sale"
  $ sentinel add --force https://example.com "tickets on sale""#
    )]
    Add {
        #[arg(help = "Page URL (http or https)", value_hint = ValueHint::Url)]
        target: String,
        #[arg(help = "Text to wait for")]
        query: String,
        #[arg(long, help = "Append even if an identical task exists")]
        force: bool,
    },
    #[command(
        about = "List tasks",
        after_help = r#"EXAMPLES
  $ sentinel list
  $ sentinel list --pending"#
    )]
    List {
        #[arg(long, help = "Only tasks that have not matched yet")]
        pending: bool,
    },
    #[command(arg_required_else_help = true, about = "Show one task")]
    Get {
        #[arg(help = "Task id")]
        id: String,
    },
    #[command(
        about = "Remove tasks",
        long_about = r#"Remove a task by id, or every task with the given target and query."#,
        after_help = r#"EXAMPLES
  $ sentinel remove 0f6c2a9e-...
  $ sentinel remove --target https://example.com --query "tickets on sale""#
    )]
    Remove {
        #[arg(help = "Task id", conflicts_with_all = ["target", "query"])]
        id: Option<String>,
        #[arg(long, requires = "query", help = "Target of the tasks to remove")]
        target: Option<String>,
        #[arg(long, requires = "target", help = "Query of the tasks to remove")]
        query: Option<String>,
    },
    #[command(arg_required_else_help = true, about = "Mark a task complete")]
    Complete {
        #[arg(help = "Task id")]
        id: String,
        #[arg(long, help = "Reopen the task instead")]
        undo: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Check one task now",
        long_about = r#"Fetch the task's page once and score it against the query.

A match marks the task complete."#
    )]
    Check {
        #[arg(help = "Task id")]
        id: String,
        #[arg(long, help = "Match threshold in [0, 1] (local only)")]
        threshold: Option<f64>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Score a page against a query without touching the task log",
        after_help = r#"EXAMPLES
  $ sentinel match https://example.com "example domain""#
    )]
    Match {
        #[arg(help = "Page URL", value_hint = ValueHint::Url)]
        url: String,
        #[arg(help = "Text to look for")]
        query: String,
        #[arg(long, help = "Match threshold in [0, 1] (local only)")]
        threshold: Option<f64>,
    },
    #[command(
        about = "Serve the HTTP API and observe pending tasks",
        long_about = r#"Start the HTTP/JSON server.

Pending tasks are checked every --interval-secs until they match.
By default pages are scored locally; --matcher-url delegates to a running
matcher service and --matcher-cmd starts one with --port=<N>."#,
        after_help = r#"EXAMPLES
  $ sentinel serve
  $ sentinel serve --bind 127.0.0.1:7600 --interval-secs 60
  $ sentinel serve --matcher-cmd ./matcher --matcher-arg --model=small"#
    )]
    Serve(ServeArgs),
    #[command(
        about = "Print version info",
        after_help = r#"EXAMPLES
  $ sentinel version"#
    )]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ sentinel completion bash > ~/.local/share/bash-completion/completions/sentinel
  $ sentinel completion fish > ~/.config/fish/completions/sentinel.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:7600", help = "Bind address")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 30, help = "Seconds between checks of each pending task")]
    interval_secs: u64,
    #[arg(long, default_value_t = DEFAULT_THRESHOLD, help = "Match threshold in [0, 1]")]
    threshold: f64,
    #[arg(long, default_value_t = 4, help = "Maximum checks in flight")]
    max_concurrent_checks: usize,
    #[arg(long, help = "Base URL of an external matcher service", value_hint = ValueHint::Url)]
    matcher_url: Option<String>,
    #[arg(
        long,
        help = "Start this matcher program with --port=<N>",
        value_hint = ValueHint::CommandName
    )]
    matcher_cmd: Option<String>,
    #[arg(
        long = "matcher-arg",
        allow_hyphen_values = true,
        help = "Extra argument for --matcher-cmd (repeatable)"
    )]
    matcher_args: Vec<String>,
    #[arg(long, help = "Allow binding to non-loopback addresses")]
    allow_non_loopback: bool,
    #[arg(long, default_value_t = 1024 * 1024, help = "Maximum request body size")]
    max_body_bytes: u64,
    #[arg(long, help = "Serve the API without observing pending tasks")]
    no_observe: bool,
}

fn serve_config_from_args(args: ServeArgs, log_path: PathBuf) -> serve::ServeConfig {
    serve::ServeConfig {
        bind: args.bind,
        log_path,
        interval: Duration::from_secs(args.interval_secs),
        threshold: args.threshold,
        max_concurrent_checks: args.max_concurrent_checks,
        matcher_url: args.matcher_url,
        matcher_cmd: args.matcher_cmd,
        matcher_args: args.matcher_args,
        allow_non_loopback: args.allow_non_loopback,
        max_body_bytes: args.max_body_bytes,
        observe: !args.no_observe,
    }
}

/// Where task commands go: the local log file or a running server.
enum Backend {
    Local(TaskClient),
    Remote(RemoteTaskClient),
}

impl Backend {
    fn new(log_path: PathBuf, server: Option<String>) -> Result<Self, Error> {
        match server {
            Some(url) => Ok(Self::Remote(RemoteTaskClient::new(url)?)),
            None => Ok(Self::Local(TaskClient::new().with_log_path(log_path))),
        }
    }

    fn register(&self, target: &str, query: &str, mode: RegisterMode) -> Result<Registered, Error> {
        match self {
            Self::Local(client) => client.register(target, query, mode),
            Self::Remote(client) => client.register(target, query, mode),
        }
    }

    fn list(&self, pending: bool) -> Result<Vec<Task>, Error> {
        match (self, pending) {
            (Self::Local(client), false) => client.list(),
            (Self::Local(client), true) => client.pending(),
            (Self::Remote(client), false) => client.list(),
            (Self::Remote(client), true) => client.pending(),
        }
    }

    fn get(&self, id: &str) -> Result<Task, Error> {
        match self {
            Self::Local(client) => client.get(id),
            Self::Remote(client) => client.get(id),
        }
    }

    fn remove(&self, id: &str) -> Result<Task, Error> {
        match self {
            Self::Local(client) => client.remove(id),
            Self::Remote(client) => client.remove(id),
        }
    }

    fn remove_matching(&self, target: &str, query: &str) -> Result<usize, Error> {
        match self {
            Self::Local(client) => client.remove_matching(target, query),
            Self::Remote(client) => client.remove_matching(target, query),
        }
    }

    fn set_complete(&self, id: &str, complete: bool) -> Result<Task, Error> {
        match self {
            Self::Local(client) => client.set_complete(id, complete),
            Self::Remote(client) => client.set_complete(id, complete),
        }
    }
}

fn reject_remote_threshold(backend: &Backend, threshold: Option<f64>) -> Result<(), Error> {
    if matches!(backend, Backend::Remote(_)) && threshold.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--threshold only applies to local checks")
            .with_hint("Set the threshold on the server with `sentinel serve --threshold`."));
    }
    Ok(())
}

fn validate_threshold(threshold: f64) -> Result<f64, Error> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--threshold must be between 0 and 1")
            .with_hint("Use a value like 0.6."));
    }
    Ok(threshold)
}

fn add_missing_task_hint(err: Error, id: &str) -> Error {
    if err.kind() != ErrorKind::NotFound || err.hint().is_some() {
        return err;
    }
    err.with_task_id(id)
        .with_hint("List known task ids with `sentinel list`.")
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check file permissions or use --log to a writable location.",
        ),
        ErrorKind::Busy => {
            err.with_hint("Task log is busy (another process holds the lock). Retry with backoff.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        ErrorKind::Network => {
            err.with_hint("The page could not be fetched. Check the URL and your connection.")
        }
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Task log is not valid JSON. Fix or move the file, then retry.")
}

fn add_unavailable_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Unavailable || err.hint().is_some() {
        return err;
    }
    err.with_hint("Service unavailable. Check that the server or matcher is running.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn task_json(task: &Task) -> Value {
    json!({
        "id": task.id,
        "target": task.target,
        "query": task.query,
        "complete": task.complete,
    })
}

fn registered_json(registered: &Registered) -> Value {
    json!({
        "task": task_json(registered.task()),
        "created": registered.is_new(),
    })
}

fn outcome_json(outcome: &MatchOutcome) -> Value {
    json!({
        "matched": outcome.matched,
        "score": outcome.score,
    })
}

fn check_report_json(report: &CheckReport) -> Value {
    json!({
        "task": task_json(&report.task),
        "matched": report.outcome.matched,
        "score": report.outcome.score,
    })
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("sentinel {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "sentinel",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Network => "network error".to_string(),
        ErrorKind::Unavailable => "service unavailable".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(task_id) = err.task_id() {
        inner.insert("task_id".to_string(), json!(task_id));
    }
    if let Some(url) = err.url() {
        inner.insert("url".to_string(), json!(url));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(task_id) = err.task_id() {
        lines.push(format!("task: {task_id}"));
    }
    if let Some(url) = err.url() {
        lines.push(format!("url: {url}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `sentinel --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "sentinel") else {
        return "Try `sentinel --help`.".to_string();
    };

    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `sentinel --help`.".to_string();
    }
    format!("Try `sentinel {} --help`.", parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::{
        Backend, Cli, Command, Error, ErrorKind, add_corrupt_hint, add_io_hint,
        add_missing_task_hint, error_json, error_text, reject_remote_threshold,
        serve_config_from_args, validate_threshold,
    };
    use clap::Parser;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn serve_defaults_map_to_config() {
        let cli = Cli::try_parse_from(["sentinel", "--log", "/tmp/tasks.json", "serve"])
            .expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = serve_config_from_args(args, PathBuf::from("/tmp/tasks.json"));
        assert_eq!(config.bind.to_string(), "127.0.0.1:7600");
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_checks, 4);
        assert!(config.observe);
        assert!(config.matcher_url.is_none());
    }

    #[test]
    fn matcher_args_are_repeatable() {
        let cli = Cli::try_parse_from([
            "sentinel",
            "serve",
            "--matcher-cmd",
            "./matcher",
            "--matcher-arg",
            "--model=small",
            "--matcher-arg",
            "--verbose",
        ])
        .expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.matcher_args, vec!["--model=small", "--verbose"]);
    }

    #[test]
    fn remove_requires_target_and_query_together() {
        assert!(Cli::try_parse_from(["sentinel", "remove", "--target", "https://a.test"]).is_err());
        assert!(
            Cli::try_parse_from(["sentinel", "remove", "abc", "--target", "t", "--query", "q"])
                .is_err()
        );
        assert!(
            Cli::try_parse_from(["sentinel", "remove", "--target", "t", "--query", "q"]).is_ok()
        );
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["sentinel", "list", "--log", "/tmp/x.json"])
            .expect("parse");
        assert_eq!(cli.log, Some(PathBuf::from("/tmp/x.json")));
    }

    #[test]
    fn threshold_rejected_for_remote_backend() {
        let backend =
            Backend::new(PathBuf::from("unused"), Some("http://127.0.0.1:7600".to_string()))
                .expect("backend");
        let err = reject_remote_threshold(&backend, Some(0.5)).expect_err("usage");
        assert_eq!(err.kind(), ErrorKind::Usage);
        reject_remote_threshold(&backend, None).expect("no threshold");
    }

    #[test]
    fn threshold_bounds() {
        assert!(validate_threshold(0.0).is_ok());
        assert!(validate_threshold(1.0).is_ok());
        assert!(validate_threshold(1.1).is_err());
        assert!(validate_threshold(f64::NAN).is_err());
    }

    #[test]
    fn hints_are_added_once() {
        let err = add_corrupt_hint(Error::new(ErrorKind::Corrupt).with_message("bad"));
        assert!(err.hint().is_some_and(|hint| hint.contains("not valid JSON")));

        let err = add_io_hint(Error::new(ErrorKind::Io).with_hint("keep me"));
        assert_eq!(err.hint(), Some("keep me"));

        let err = add_missing_task_hint(Error::new(ErrorKind::NotFound), "abc");
        assert_eq!(err.task_id(), Some("abc"));
        assert!(err.hint().is_some());
    }

    #[test]
    fn error_json_includes_context() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message("task not found")
            .with_task_id("abc")
            .with_path("/tmp/tasks.json")
            .with_source(std::io::Error::other("inner"));
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "NotFound");
        assert_eq!(value["error"]["task_id"], "abc");
        assert_eq!(value["error"]["path"], "/tmp/tasks.json");
        assert_eq!(value["error"]["causes"][0], "inner");
    }

    #[test]
    fn error_text_lists_fields() {
        let err = Error::new(ErrorKind::Usage)
            .with_message("bad input")
            .with_hint("try again");
        let text = error_text(&err);
        assert!(text.starts_with("error: bad input"));
        assert!(text.contains("hint: try again"));
    }
}
