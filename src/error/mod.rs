mod context;
mod format;

pub use context::ErrorContext;
pub use format::{format_error_chain, format_error_with_color};

use crate::locking::DeadlockReport;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Not all of the locks specified are held by the current thread: {locks}")]
    NotHeldByCurrentThread { locks: String },

    #[error("Unsupported lock operation: {0}")]
    UnsupportedOperation(String),

    #[error(
        "Cannot acquire {requested} permits of shared resource '{resource}' with a total capacity of {capacity}"
    )]
    InvalidPermitCount {
        resource: String,
        requested: usize,
        capacity: usize,
    },

    #[error("Shared resource '{0}' is not registered")]
    UnknownSharedResource(String),

    #[error("Shared resource '{0}' is already registered")]
    DuplicateSharedResource(String),

    #[error("Thread '{thread}' is not allowed to change the locks it holds (attempted {lock})")]
    LockChangesDisallowed { thread: String, lock: String },

    #[error("Thread '{0}' is already running a lock transform")]
    NestedStateLock(String),

    #[error("Thread '{thread}' cannot access the {project} without holding its lock")]
    ProjectAccessDenied { thread: String, project: String },

    #[error("Lock '{0}' was dropped while in use")]
    LockDropped(String),

    #[error("Deadlock detected while acquiring locks:\n{0}")]
    Deadlock(DeadlockReport),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;
