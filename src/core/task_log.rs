// JSON task log: `{ "taskList": [...] }`, rewritten atomically under an advisory lock.
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::task::Task;

pub const DEFAULT_LOG_FILE: &str = ".task_log.json";
const TASK_LIST_KEY: &str = "taskList";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterMode {
    /// Append even when an identical task is already logged.
    Force,
    /// Return the logged task instead of appending a content duplicate.
    SkipDuplicates,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Registered {
    Added(Task),
    Existing(Task),
}

impl Registered {
    pub fn task(&self) -> &Task {
        match self {
            Registered::Added(task) | Registered::Existing(task) => task,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            Registered::Added(task) | Registered::Existing(task) => task,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registered::Added(_))
    }
}

#[derive(Clone, Debug)]
pub struct TaskLog {
    path: PathBuf,
}

struct Document {
    root: Map<String, Value>,
    tasks: Vec<Task>,
}

impl Document {
    fn empty() -> Self {
        Self {
            root: Map::new(),
            tasks: Vec::new(),
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }
}

struct LogLock {
    file: File,
}

impl Drop for LogLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl TaskLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Creates the log with an empty task list if it does not exist yet.
    pub fn ensure(&self) -> Result<(), Error> {
        self.update(|_| Ok(()))
    }

    pub fn load(&self) -> Result<Vec<Task>, Error> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let _lock = self.lock(false)?;
        Ok(self.read_document()?.tasks)
    }

    pub fn get(&self, id: &str) -> Result<Task, Error> {
        self.load()?
            .into_iter()
            .find(|task| task.id == id)
            .ok_or_else(|| not_found(id, &self.path))
    }

    pub fn register(&self, task: Task, mode: RegisterMode) -> Result<Registered, Error> {
        self.update(|doc| {
            if doc.position(&task.id).is_some() {
                return Err(Error::new(ErrorKind::AlreadyExists)
                    .with_message("task id already registered")
                    .with_task_id(task.id.clone()));
            }
            if mode == RegisterMode::SkipDuplicates {
                if let Some(existing) = doc.tasks.iter().find(|logged| logged.same_as(&task)) {
                    return Ok(Registered::Existing(existing.clone()));
                }
            }
            doc.tasks.push(task.clone());
            Ok(Registered::Added(task))
        })
    }

    pub fn set_complete(&self, id: &str, complete: bool) -> Result<Task, Error> {
        self.update(|doc| {
            let index = doc.position(id).ok_or_else(|| not_found(id, &self.path))?;
            doc.tasks[index].complete = complete;
            Ok(doc.tasks[index].clone())
        })
    }

    pub fn remove(&self, id: &str) -> Result<Task, Error> {
        self.update(|doc| {
            let index = doc.position(id).ok_or_else(|| not_found(id, &self.path))?;
            Ok(doc.tasks.remove(index))
        })
    }

    /// Removes every logged task with the same content as `task`, whatever its id.
    pub fn remove_matching(&self, task: &Task) -> Result<usize, Error> {
        if !self.exists() {
            return Ok(0);
        }
        self.update(|doc| {
            let before = doc.tasks.len();
            doc.tasks.retain(|logged| !logged.same_as(task));
            Ok(before - doc.tasks.len())
        })
    }

    fn update<T>(&self, apply: impl FnOnce(&mut Document) -> Result<T, Error>) -> Result<T, Error> {
        self.ensure_parent()?;
        let _lock = self.lock(true)?;
        let mut doc = if self.exists() {
            self.read_document()?
        } else {
            Document::empty()
        };
        let out = apply(&mut doc)?;
        self.write_document(doc)?;
        Ok(out)
    }

    fn ensure_parent(&self) -> Result<(), Error> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
                .map_err(|err| Error::from_io(err, "failed to create task log directory", parent)),
            _ => Ok(()),
        }
    }

    fn lock(&self, exclusive: bool) -> Result<LogLock, Error> {
        let lock_path = sidecar_path(&self.path, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|err| Error::from_io(err, "failed to open task log lock", &lock_path))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to lock task log")
                .with_path(&lock_path)
                .with_source(err)
        })?;
        Ok(LogLock { file })
    }

    fn read_document(&self) -> Result<Document, Error> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|err| Error::from_io(err, "failed to read task log", &self.path))?;
        let value: Value = serde_json::from_str(&raw).map_err(|err| {
            corrupt(&self.path, "task log is not valid JSON").with_source(err)
        })?;
        let Value::Object(mut root) = value else {
            return Err(corrupt(&self.path, "task log root must be a JSON object"));
        };
        let list = match root.remove(TASK_LIST_KEY) {
            Some(Value::Array(list)) => list,
            Some(_) => return Err(corrupt(&self.path, "taskList must be an array")),
            None => return Err(corrupt(&self.path, "task log is missing taskList")),
        };
        let mut tasks = Vec::with_capacity(list.len());
        for entry in list {
            let task: Task = serde_json::from_value(entry)
                .map_err(|err| corrupt(&self.path, "invalid task record").with_source(err))?;
            tasks.push(task);
        }
        Ok(Document { root, tasks })
    }

    fn write_document(&self, doc: Document) -> Result<(), Error> {
        let Document { mut root, tasks } = doc;
        let list = serde_json::to_value(tasks).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode task list")
                .with_source(err)
        })?;
        root.insert(TASK_LIST_KEY.to_string(), list);
        let mut bytes = serde_json::to_vec_pretty(&Value::Object(root)).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode task log")
                .with_source(err)
        })?;
        bytes.push(b'\n');

        let tmp_path = sidecar_path(&self.path, ".tmp");
        let mut tmp = File::create(&tmp_path)
            .map_err(|err| Error::from_io(err, "failed to create temp task log", &tmp_path))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.sync_all())
            .map_err(|err| Error::from_io(err, "failed to write temp task log", &tmp_path))?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)
            .map_err(|err| Error::from_io(err, "failed to replace task log", &self.path))
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from(DEFAULT_LOG_FILE));
    name.push(suffix);
    path.with_file_name(name)
}

fn not_found(id: &str, path: &Path) -> Error {
    Error::new(ErrorKind::NotFound)
        .with_message("task not found")
        .with_task_id(id)
        .with_path(path)
}

fn corrupt(path: &Path, message: &str) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message(message)
        .with_path(path)
}

#[cfg(test)]
mod tests {
    use super::{RegisterMode, Registered, TaskLog, sidecar_path};
    use crate::core::error::ErrorKind;
    use crate::core::task::Task;
    use std::path::{Path, PathBuf};

    fn temp_log() -> (tempfile::TempDir, TaskLog) {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = TaskLog::open(dir.path().join(".task_log.json"));
        (dir, log)
    }

    fn task(target: &str, query: &str) -> Task {
        Task::new(target, query)
    }

    #[test]
    fn missing_log_loads_empty() {
        let (_dir, log) = temp_log();
        assert!(!log.exists());
        assert!(log.load().expect("load").is_empty());
    }

    #[test]
    fn ensure_writes_empty_task_list() {
        let (_dir, log) = temp_log();
        log.ensure().expect("ensure");
        let raw = std::fs::read_to_string(log.path()).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value, serde_json::json!({ "taskList": [] }));
    }

    #[test]
    fn register_update_and_remove() {
        let (_dir, log) = temp_log();
        let first = task("https://example.com/a", "When A happens");
        let second = task("https://example.com/b", "When B happens");
        log.register(first.clone(), RegisterMode::Force).expect("first");
        log.register(second.clone(), RegisterMode::Force).expect("second");

        let loaded = log.load().expect("load");
        assert_eq!(loaded, vec![first.clone(), second.clone()]);

        let updated = log.set_complete(&first.id, true).expect("complete");
        assert!(updated.complete);
        assert!(log.get(&first.id).expect("get").complete);
        assert!(!log.get(&second.id).expect("get").complete);

        let removed = log.remove(&second.id).expect("remove");
        assert_eq!(removed.id, second.id);
        assert_eq!(log.load().expect("load").len(), 1);
    }

    #[test]
    fn skip_duplicates_returns_existing_task() {
        let (_dir, log) = temp_log();
        let original = task("https://example.com", "When it ships");
        let registered = log
            .register(original.clone(), RegisterMode::SkipDuplicates)
            .expect("register");
        assert!(registered.is_new());

        let duplicate = task("https://example.com", "When it ships");
        let registered = log
            .register(duplicate.clone(), RegisterMode::SkipDuplicates)
            .expect("register");
        assert_eq!(registered, Registered::Existing(original.clone()));

        let forced = log
            .register(duplicate, RegisterMode::Force)
            .expect("register");
        assert!(forced.is_new());
        assert_eq!(log.load().expect("load").len(), 2);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let (_dir, log) = temp_log();
        let original = task("https://example.com", "q");
        log.register(original.clone(), RegisterMode::Force).expect("register");
        let err = log
            .register(original, RegisterMode::Force)
            .expect_err("duplicate id");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn remove_matching_ignores_ids() {
        let (_dir, log) = temp_log();
        let keep = task("https://example.com/keep", "q");
        log.register(keep.clone(), RegisterMode::Force).expect("keep");
        for _ in 0..2 {
            log.register(task("https://example.com/drop", "q"), RegisterMode::Force)
                .expect("drop");
        }
        let selector = task("https://example.com/drop", "q");
        assert_eq!(log.remove_matching(&selector).expect("remove"), 2);
        assert_eq!(log.load().expect("load"), vec![keep]);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (_dir, log) = temp_log();
        log.ensure().expect("ensure");
        for err in [
            log.get("missing").expect_err("get"),
            log.set_complete("missing", true).expect_err("complete"),
            log.remove("missing").expect_err("remove"),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
            assert_eq!(err.task_id(), Some("missing"));
        }
    }

    #[test]
    fn corrupt_logs_are_reported() {
        let (_dir, log) = temp_log();
        for raw in ["not json", "[]", "{}", "{\"taskList\": {}}", "{\"taskList\": [1]}"] {
            std::fs::write(log.path(), raw).expect("write");
            let err = log.load().expect_err("corrupt");
            assert_eq!(err.kind(), ErrorKind::Corrupt, "input: {raw}");
        }
    }

    #[test]
    fn extra_top_level_keys_survive_rewrites() {
        let (_dir, log) = temp_log();
        std::fs::write(
            log.path(),
            r#"{"owner": "ops", "taskList": [{"id": "t1", "target": "https://example.com", "query": "q", "complete": false}]}"#,
        )
        .expect("write");
        log.set_complete("t1", true).expect("complete");

        let raw = std::fs::read_to_string(log.path()).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["owner"], "ops");
        assert_eq!(value["taskList"][0]["complete"], true);
    }

    #[test]
    fn nested_log_directories_are_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = TaskLog::open(dir.path().join("state").join("tasks.json"));
        log.register(task("https://example.com", "q"), RegisterMode::Force)
            .expect("register");
        assert!(log.exists());
    }

    #[test]
    fn concurrent_registrations_are_serialized() {
        let (_dir, log) = temp_log();
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    log.register(
                        task(&format!("https://example.com/{i}"), "q"),
                        RegisterMode::Force,
                    )
                    .expect("register");
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("join");
        }
        assert_eq!(log.load().expect("load").len(), 8);
    }

    #[test]
    fn sidecar_paths_append_suffix() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/.task_log.json"), ".lock"),
            PathBuf::from("/tmp/.task_log.json.lock")
        );
    }
}
