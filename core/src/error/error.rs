use std::path::PathBuf;

use thiserror::Error;

use crate::expr::SyntaxError;
use crate::state::StreamKey;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("action failed: {0}")]
    Action(#[from] ActionError),
    #[error("{action} failed: {message}")]
    ActionFailed { action: String, message: String },
    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("command failed: {0}")]
    Command(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to encode {stream} record: {source}")]
    Encode {
        stream: StreamKey,
        source: serde_json::Error,
    },
    #[error("failed to decode {stream} record: {source}")]
    Decode {
        stream: StreamKey,
        source: serde_json::Error,
    },
    #[error("invalid patch path '{0}'")]
    InvalidPath(String),
    #[error("patch '{path}' is missing a value")]
    MissingValue { path: String },
    #[error("{stream} entity '{id}' not found")]
    NotFound { stream: StreamKey, id: String },
    #[error("mutation rejected: {0}")]
    Rejected(String),
}

/// Failure reported by the analytical engine behind the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0}")]
    Execution(String),
    #[error("unsupported source: {0}")]
    Unsupported(String),
    #[error("engine io error: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("query for '{owner}' was superseded by a newer submission")]
    Superseded { owner: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("query scheduler shut down")]
    SchedulerClosed,
    #[error("engine returned an unexpected result for {0}")]
    UnexpectedOutput(&'static str),
}

impl QueryError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid status transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::state::EntityStatus,
        to: crate::state::EntityStatus,
    },
}

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("invalid arguments for {action}: {message}")]
    InvalidArgs {
        action: &'static str,
        message: String,
    },
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("snapshot error: {0}")]
    Snapshot(#[from] anyhow::Error),
    #[error("wire encoding error: {0}")]
    Wire(#[from] serde_json::Error),
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Action(#[from] ActionError),
}
