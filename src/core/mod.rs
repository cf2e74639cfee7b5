// Core modules implementing task records, the task log, text extraction, and scoring.
pub mod error;
pub mod similarity;
pub mod task;
pub mod task_log;
pub mod text;
