// Task records: a target page plus the condition to watch for on it.
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub target: String,
    pub query: String,
    #[serde(default)]
    pub complete: bool,
}

impl Task {
    pub fn new(target: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: new_task_id(),
            target: target.into(),
            query: query.into(),
            complete: false,
        }
    }

    /// Content equality: target, query and completion state. The id is ignored.
    pub fn same_as(&self, other: &Task) -> bool {
        self.target == other.target && self.query == other.query && self.complete == other.complete
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_target(&self.target)?;
        if self.query.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("query must not be empty")
                .with_hint("Describe the condition to watch for, e.g. \"When results are announced\"."));
        }
        Ok(())
    }
}

pub fn validate_target(target: &str) -> Result<Url, Error> {
    let url = Url::parse(target).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("target must be an absolute URL")
            .with_url(target)
            .with_source(err)
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("unsupported target scheme: {scheme}"))
            .with_url(target)
            .with_hint("Use an http:// or https:// URL.")),
    }
}

/// Random (version 4) UUID in lowercase hyphenated form.
pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}
