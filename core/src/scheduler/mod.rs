//! Query scheduling against the analytical engine
//!
//! ```text
//! Dispatcher ──session(owner, priority)──▶ QueryScheduler ──▶ PendingQueue
//!                                               │  (rank: active > class > FIFO)
//!                                               ▼
//!                                    worker tasks (≤ max_concurrency)
//!                                               │
//!                                               ▼
//!                                       AnalyticalEngine
//! ```

pub mod engine;
pub mod estimate;
pub mod histogram;
pub mod profile;
mod queue;
#[allow(clippy::module_inception)]
mod scheduler;

pub use engine::{model_relation, quote_ident, table_relation, AnalyticalEngine, ColumnInfo, QueryResult};
pub use histogram::compute_histogram;
pub use profile::{describe, is_numeric_type, summarize, Described, Summary};
pub use queue::{Priority, QueryTask, TaskOutput};
pub use scheduler::{DeprioritizeGuard, QueryScheduler, QuerySession, SchedulerStats};
