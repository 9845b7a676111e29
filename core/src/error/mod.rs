#[allow(clippy::module_inception)]
pub mod error;

pub use error::{
    ActionError, CliError, EngineError, QueryError, StoreError, SyncError, TransitionError,
};
