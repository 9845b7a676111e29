use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::oneshot;

use super::engine::{AnalyticalEngine, QueryResult};
use crate::error::{EngineError, QueryError};
use crate::state::{RollupInterval, SourceFormat, TimeGrain};

/// Priority class of a submission. Lower ranks run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    /// Direct edits of the active entity.
    Interactive = 0,
    /// Automatic profiling.
    Background = 1,
    /// Profiling of tables a running model query depends on.
    Deprioritized = 2,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Interactive => "interactive",
            Self::Background => "background",
            Self::Deprioritized => "deprioritized",
        };
        f.write_str(s)
    }
}

/// One unit of engine work.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTask {
    Execute(String),
    LoadSource {
        table: String,
        path: PathBuf,
        format: SourceFormat,
    },
    DropTable(String),
    EstimateTimeGrain {
        relation: String,
        column: String,
    },
    EstimateRollup {
        relation: String,
        column: String,
    },
}

impl QueryTask {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute(_) => "execute",
            Self::LoadSource { .. } => "load_source",
            Self::DropTable(_) => "drop_table",
            Self::EstimateTimeGrain { .. } => "estimate_time_grain",
            Self::EstimateRollup { .. } => "estimate_rollup",
        }
    }

    pub(crate) async fn run(&self, engine: &dyn AnalyticalEngine) -> Result<TaskOutput, EngineError> {
        match self {
            Self::Execute(sql) => engine.execute(sql).await.map(TaskOutput::Rows),
            Self::LoadSource {
                table,
                path,
                format,
            } => engine
                .load_source(table, path, *format)
                .await
                .map(|size_bytes| TaskOutput::Loaded { size_bytes }),
            Self::DropTable(table) => engine.drop_table(table).await.map(|_| TaskOutput::Dropped),
            Self::EstimateTimeGrain { relation, column } => engine
                .estimate_smallest_time_grain(relation, column)
                .await
                .map(TaskOutput::TimeGrain),
            Self::EstimateRollup { relation, column } => engine
                .estimate_ideal_rollup_interval(relation, column)
                .await
                .map(TaskOutput::Rollup),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Rows(QueryResult),
    Loaded { size_bytes: u64 },
    Dropped,
    TimeGrain(Option<TimeGrain>),
    Rollup(Option<RollupInterval>),
}

pub(crate) type Reply = oneshot::Sender<Result<TaskOutput, QueryError>>;

/// A queued submission.
pub(crate) struct Pending {
    pub seq: u64,
    pub owner: String,
    pub generation: u64,
    pub priority: Priority,
    pub task: QueryTask,
    pub reply: Reply,
}

/// Pending submissions; selection order is decided by the caller's ranking.
#[derive(Default)]
pub(crate) struct PendingQueue {
    items: Vec<Pending>,
}

impl PendingQueue {
    pub fn push(&mut self, pending: Pending) {
        self.items.push(pending);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Best rank among queued entries.
    pub fn best_rank<F>(&self, rank: F) -> Option<Priority>
    where
        F: Fn(&Pending) -> Priority,
    {
        self.items.iter().map(rank).min()
    }

    /// Remove the entry with the lowest `(rank, seq)`.
    pub fn pop_best<F>(&mut self, rank: F) -> Option<Pending>
    where
        F: Fn(&Pending) -> Priority,
    {
        let idx = self
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| (rank(p), p.seq))
            .map(|(i, _)| i)?;
        Some(self.items.remove(idx))
    }

    /// Remove every entry matching `pred`, in submission order.
    pub fn drain_where<F>(&mut self, pred: F) -> Vec<Pending>
    where
        F: Fn(&Pending) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|p| pred(p));
        self.items = kept;
        taken
    }

    /// Queued entries per owner, for status reports.
    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|p| p.owner.as_str())
    }
}
