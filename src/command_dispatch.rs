//! Purpose: Hold top-level CLI command dispatch for `sentinel`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command prints one JSON value on success; errors bubble to `main`.

use super::*;
use sentinel::api::{HttpFetcher, LocalMatcher, MatchRequest, Matcher, check_task};

pub(super) fn dispatch_command(
    command: Command,
    log_path: PathBuf,
    server: Option<String>,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "sentinel", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            if server.is_some() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--server cannot be combined with serve")
                    .with_hint("Use --log to choose the task log the server manages."));
            }
            let config = serve_config_from_args(args, log_path);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Add {
            target,
            query,
            force,
        } => {
            let backend = Backend::new(log_path, server)?;
            let mode = if force {
                RegisterMode::Force
            } else {
                RegisterMode::SkipDuplicates
            };
            let registered = backend.register(&target, &query, mode)?;
            emit_json(registered_json(&registered));
            Ok(RunOutcome::ok())
        }
        Command::List { pending } => {
            let backend = Backend::new(log_path, server)?;
            let tasks = backend.list(pending)?;
            let values = tasks.iter().map(task_json).collect::<Vec<_>>();
            emit_json(json!({ "tasks": values }));
            Ok(RunOutcome::ok())
        }
        Command::Get { id } => {
            let backend = Backend::new(log_path, server)?;
            let task = backend
                .get(&id)
                .map_err(|err| add_missing_task_hint(err, &id))?;
            emit_json(json!({ "task": task_json(&task) }));
            Ok(RunOutcome::ok())
        }
        Command::Remove { id, target, query } => {
            let backend = Backend::new(log_path, server)?;
            match (id, target, query) {
                (Some(id), _, _) => {
                    let task = backend
                        .remove(&id)
                        .map_err(|err| add_missing_task_hint(err, &id))?;
                    emit_json(json!({ "removed": 1, "task": task_json(&task) }));
                }
                (None, Some(target), Some(query)) => {
                    let removed = backend.remove_matching(&target, &query)?;
                    emit_json(json!({ "removed": removed }));
                }
                _ => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("remove requires a task id or --target and --query")
                        .with_hint("Use `sentinel remove <id>` or `sentinel remove --target <url> --query <text>`."));
                }
            }
            Ok(RunOutcome::ok())
        }
        Command::Complete { id, undo } => {
            let backend = Backend::new(log_path, server)?;
            let task = backend
                .set_complete(&id, !undo)
                .map_err(|err| add_missing_task_hint(err, &id))?;
            emit_json(json!({ "task": task_json(&task) }));
            Ok(RunOutcome::ok())
        }
        Command::Check { id, threshold } => {
            let backend = Backend::new(log_path, server)?;
            reject_remote_threshold(&backend, threshold)?;
            let report = match &backend {
                Backend::Local(client) => {
                    let matcher = local_matcher(threshold)?;
                    let task = client.get(&id)?;
                    check_task(client, &matcher, task)
                }
                Backend::Remote(client) => client.check(&id),
            }
            .map_err(|err| add_missing_task_hint(err, &id))?;
            emit_json(check_report_json(&report));
            Ok(RunOutcome::ok())
        }
        Command::Match {
            url,
            query,
            threshold,
        } => {
            let backend = Backend::new(log_path, server)?;
            reject_remote_threshold(&backend, threshold)?;
            let outcome = match &backend {
                Backend::Local(_) => {
                    local_matcher(threshold)?.evaluate(&MatchRequest::new(&url, &query))?
                }
                Backend::Remote(client) => client.match_page(&url, &query)?,
            };
            emit_json(outcome_json(&outcome));
            Ok(RunOutcome::ok())
        }
    }
}

fn local_matcher(threshold: Option<f64>) -> Result<LocalMatcher, Error> {
    let threshold = validate_threshold(threshold.unwrap_or(DEFAULT_THRESHOLD))?;
    Ok(LocalMatcher::new(Arc::new(HttpFetcher::new())).with_threshold(threshold))
}
