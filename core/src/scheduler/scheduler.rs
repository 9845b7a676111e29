use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

use super::engine::{AnalyticalEngine, QueryResult};
use super::queue::{Pending, PendingQueue, Priority, QueryTask, Reply, TaskOutput};
use crate::error::{EngineError, QueryError};
use crate::state::{RollupInterval, SourceFormat, TimeGrain};
use crate::util::lock;

/// Counters for status reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub superseded: u64,
    pub queued: usize,
    pub running: usize,
}

struct Running {
    owner: String,
    generation: u64,
    priority: Priority,
    /// Taken when the run is superseded; the engine call still finishes.
    reply: Option<Reply>,
}

struct SchedulerState {
    queue: PendingQueue,
    running: HashMap<u64, Running>,
    /// Current session generation per owner; absent once the owner is idle.
    generations: HashMap<String, u64>,
    /// Slots held for an interactive session between two of its queries.
    leases: HashMap<String, u64>,
    active: Option<String>,
    deprioritized: HashMap<String, usize>,
    next_seq: u64,
    next_generation: u64,
    closed: bool,
    stats: SchedulerStats,
}

struct SchedulerInner {
    engine: Arc<dyn AnalyticalEngine>,
    max_concurrency: usize,
    state: Mutex<SchedulerState>,
    finished: Notify,
}

/// Query scheduler
///
/// Bounded-concurrency front of the analytical engine. Submissions are made
/// through a [`QuerySession`]; opening a new session for an owner supersedes
/// every queued and running submission of its older sessions, whose waiters
/// resolve with [`QueryError::Superseded`] right away. Queued work is picked
/// by effective priority (activation and deprioritization are applied at
/// selection time), then FIFO.
///
/// When an interactive session's query completes and no other interactive
/// work is queued, its slot is held for the session's next query until the
/// session is dropped.
#[derive(Clone)]
pub struct QueryScheduler {
    inner: Arc<SchedulerInner>,
}

impl QueryScheduler {
    pub fn new(engine: Arc<dyn AnalyticalEngine>, max_concurrency: usize) -> Self {
        let state = SchedulerState {
            queue: PendingQueue::default(),
            running: HashMap::new(),
            generations: HashMap::new(),
            leases: HashMap::new(),
            active: None,
            deprioritized: HashMap::new(),
            next_seq: 1,
            next_generation: 1,
            closed: false,
            stats: SchedulerStats::default(),
        };

        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                max_concurrency: max_concurrency.max(1),
                state: Mutex::new(state),
                finished: Notify::new(),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Open a new session for `owner`, superseding its older sessions.
    pub fn session(&self, owner: &str, priority: Priority) -> QuerySession {
        let mut state = lock(&self.inner.state);
        let generation = next_generation(&mut state, owner);

        let superseded = supersede(&mut state, owner, generation);
        if superseded > 0 {
            tracing::debug!(
                entity_id = %owner,
                generation,
                superseded,
                "superseded older queries"
            );
        }
        self.pump(&mut state);

        QuerySession {
            scheduler: self.clone(),
            owner: owner.to_string(),
            generation,
            priority,
        }
    }

    /// Supersede everything `owner` has queued or running without starting a
    /// new session (used when the entity is deleted).
    pub fn cancel_owner(&self, owner: &str) {
        let mut state = lock(&self.inner.state);
        let generation = next_generation(&mut state, owner);
        supersede(&mut state, owner, generation);
        state.generations.remove(owner);
        self.pump(&mut state);
    }

    /// [`QueryScheduler::cancel_owner`], then wait until engine calls the
    /// owner already started have returned.
    pub async fn cancel_owner_and_wait(&self, owner: &str) {
        self.cancel_owner(owner);
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running(owner) {
                return;
            }
            tracing::debug!(entity_id = %owner, "waiting for cancelled queries to return");
            notified.await;
        }
    }

    fn is_running(&self, owner: &str) -> bool {
        lock(&self.inner.state)
            .running
            .values()
            .any(|run| run.owner == owner)
    }

    /// Mark the entity open in the UI; its queued work ranks as interactive.
    pub fn set_active(&self, owner: Option<&str>) {
        let mut state = lock(&self.inner.state);
        state.active = owner.map(str::to_string);
        tracing::debug!(active = ?state.active, "active entity changed");

        let active = state.active.clone();
        let before = state.leases.len();
        state.leases.retain(|o, _| active.as_ref() == Some(o));
        if state.leases.len() != before {
            self.pump(&mut state);
        }
    }

    pub fn active(&self) -> Option<String> {
        lock(&self.inner.state).active.clone()
    }

    /// Rank queued work of `owners` as deprioritized until the guard drops.
    pub fn deprioritize(&self, owners: Vec<String>) -> DeprioritizeGuard {
        {
            let mut state = lock(&self.inner.state);
            for owner in &owners {
                *state.deprioritized.entry(owner.clone()).or_insert(0) += 1;
            }
        }
        if !owners.is_empty() {
            tracing::debug!(owners = ?owners, "deprioritized");
        }
        DeprioritizeGuard {
            scheduler: self.clone(),
            owners,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = lock(&self.inner.state);
        SchedulerStats {
            queued: state.queue.len(),
            running: state.running.len(),
            ..state.stats
        }
    }

    /// Queued owners in submission order.
    pub fn queued_owners(&self) -> Vec<String> {
        let state = lock(&self.inner.state);
        state.queue.owners().map(str::to_string).collect()
    }

    /// Refuse new work and fail everything still queued.
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        state.closed = true;
        state.leases.clear();
        for pending in state.queue.drain_where(|_| true) {
            let _ = pending.reply.send(Err(QueryError::SchedulerClosed));
        }
    }

    fn submit(
        &self,
        owner: &str,
        generation: u64,
        priority: Priority,
        task: QueryTask,
    ) -> Result<oneshot::Receiver<Result<TaskOutput, QueryError>>, QueryError> {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(QueryError::SchedulerClosed);
        }
        if state.generations.get(owner).copied() != Some(generation) {
            state.stats.superseded += 1;
            return Err(QueryError::Superseded {
                owner: owner.to_string(),
            });
        }

        if state.leases.get(owner) == Some(&generation) {
            state.leases.remove(owner);
        }

        let (tx, rx) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.stats.submitted += 1;
        tracing::trace!(
            entity_id = %owner,
            seq,
            priority = %priority,
            task = task.kind(),
            "query queued"
        );
        state.queue.push(Pending {
            seq,
            owner: owner.to_string(),
            generation,
            priority,
            task,
            reply: tx,
        });

        self.pump(&mut state);
        Ok(rx)
    }

    /// Start queued work while slots are free.
    fn pump(&self, state: &mut SchedulerState) {
        while state.running.len() + state.leases.len() < self.inner.max_concurrency {
            let active = state.active.clone();
            let deprioritized = &state.deprioritized;
            let Some(next) = state.queue.pop_best(|p| {
                effective_priority(p, active.as_deref(), deprioritized)
            }) else {
                break;
            };

            let Pending {
                seq,
                owner,
                generation,
                priority,
                task,
                reply,
            } = next;
            tracing::trace!(entity_id = %owner, seq, priority = %priority, task = task.kind(), "query started");
            state.running.insert(
                seq,
                Running {
                    owner,
                    generation,
                    priority,
                    reply: Some(reply),
                },
            );
            self.spawn_worker(seq, task);
        }
    }

    fn spawn_worker(&self, ticket: u64, task: QueryTask) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let engine = scheduler.inner.engine.clone();
            let result = AssertUnwindSafe(task.run(engine.as_ref()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(EngineError::Execution(format!(
                        "engine panicked while running {}",
                        task.kind()
                    )))
                });
            scheduler.finish(ticket, result);
        });
    }

    fn finish(&self, ticket: u64, result: Result<TaskOutput, EngineError>) {
        let mut state = lock(&self.inner.state);
        if let Some(mut run) = state.running.remove(&ticket) {
            match run.reply.take() {
                Some(reply) => {
                    if result.is_ok() {
                        state.stats.completed += 1;
                    } else {
                        state.stats.failed += 1;
                    }
                    let _ = reply.send(result.map_err(QueryError::from));
                    Self::lease(&mut state, &run);
                }
                None => {
                    tracing::trace!(
                        entity_id = %run.owner,
                        generation = run.generation,
                        "discarded superseded result"
                    );
                }
            }
        }
        self.pump(&mut state);
        drop(state);
        self.inner.finished.notify_waiters();
    }

    /// Hold the slot of a finished run for its session's next query.
    fn lease(state: &mut SchedulerState, run: &Running) {
        if state.closed || state.generations.get(&run.owner) != Some(&run.generation) {
            return;
        }
        let interactive = state.active.as_deref() == Some(run.owner.as_str())
            || run.priority == Priority::Interactive;
        if !interactive {
            return;
        }
        let active = state.active.clone();
        let deprioritized = &state.deprioritized;
        let waiting = state
            .queue
            .best_rank(|p| effective_priority(p, active.as_deref(), deprioritized));
        if waiting.map_or(true, |rank| rank > Priority::Interactive) {
            tracing::trace!(entity_id = %run.owner, generation = run.generation, "slot leased");
            state.leases.insert(run.owner.clone(), run.generation);
        }
    }

    /// Forget a dropped session: supersede anything it left behind and
    /// release its lease.
    fn end_session(&self, owner: &str, generation: u64) {
        let mut state = lock(&self.inner.state);
        if state.generations.get(owner) == Some(&generation) {
            supersede(&mut state, owner, generation + 1);
            state.generations.remove(owner);
        }
        if state.leases.get(owner) == Some(&generation) {
            state.leases.remove(owner);
        }
        self.pump(&mut state);
    }

    fn release_deprioritized(&self, owners: &[String]) {
        let mut state = lock(&self.inner.state);
        for owner in owners {
            if let Some(count) = state.deprioritized.get_mut(owner) {
                *count -= 1;
                if *count == 0 {
                    state.deprioritized.remove(owner);
                }
            }
        }
    }
}

fn next_generation(state: &mut SchedulerState, owner: &str) -> u64 {
    let generation = state.next_generation;
    state.next_generation += 1;
    state.generations.insert(owner.to_string(), generation);
    generation
}

fn effective_priority(
    pending: &Pending,
    active: Option<&str>,
    deprioritized: &HashMap<String, usize>,
) -> Priority {
    if active == Some(pending.owner.as_str()) {
        Priority::Interactive
    } else if deprioritized.contains_key(&pending.owner) {
        Priority::Deprioritized
    } else {
        pending.priority
    }
}

/// Resolve every waiter of `owner` older than `generation` as superseded.
fn supersede(state: &mut SchedulerState, owner: &str, generation: u64) -> usize {
    let mut count = 0;

    for pending in state
        .queue
        .drain_where(|p| p.owner == owner && p.generation < generation)
    {
        let _ = pending.reply.send(Err(QueryError::Superseded {
            owner: owner.to_string(),
        }));
        count += 1;
    }

    for run in state.running.values_mut() {
        if run.owner == owner && run.generation < generation {
            if let Some(reply) = run.reply.take() {
                let _ = reply.send(Err(QueryError::Superseded {
                    owner: owner.to_string(),
                }));
                count += 1;
            }
        }
    }

    if state.leases.get(owner).is_some_and(|g| *g < generation) {
        state.leases.remove(owner);
    }

    state.stats.superseded += count as u64;
    count
}

/// Handle through which one pipeline run submits its queries.
pub struct QuerySession {
    scheduler: QueryScheduler,
    owner: String,
    generation: u64,
    priority: Priority,
}

impl QuerySession {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether no newer session has been opened for the owner.
    pub fn is_current(&self) -> bool {
        let state = lock(&self.scheduler.inner.state);
        state.generations.get(&self.owner).copied() == Some(self.generation)
    }

    /// Submit a task and wait for its result.
    pub async fn run(&self, task: QueryTask) -> Result<TaskOutput, QueryError> {
        let rx = self
            .scheduler
            .submit(&self.owner, self.generation, self.priority, task)?;
        rx.await.map_err(|_| QueryError::SchedulerClosed)?
    }

    pub async fn execute(&self, sql: impl Into<String>) -> Result<QueryResult, QueryError> {
        match self.run(QueryTask::Execute(sql.into())).await? {
            TaskOutput::Rows(result) => Ok(result),
            _ => Err(QueryError::UnexpectedOutput("execute")),
        }
    }

    pub async fn load_source(
        &self,
        table: &str,
        path: PathBuf,
        format: SourceFormat,
    ) -> Result<u64, QueryError> {
        let task = QueryTask::LoadSource {
            table: table.to_string(),
            path,
            format,
        };
        match self.run(task).await? {
            TaskOutput::Loaded { size_bytes } => Ok(size_bytes),
            _ => Err(QueryError::UnexpectedOutput("load_source")),
        }
    }

    pub async fn drop_table(&self, table: &str) -> Result<(), QueryError> {
        match self.run(QueryTask::DropTable(table.to_string())).await? {
            TaskOutput::Dropped => Ok(()),
            _ => Err(QueryError::UnexpectedOutput("drop_table")),
        }
    }

    pub async fn estimate_time_grain(
        &self,
        relation: &str,
        column: &str,
    ) -> Result<Option<TimeGrain>, QueryError> {
        let task = QueryTask::EstimateTimeGrain {
            relation: relation.to_string(),
            column: column.to_string(),
        };
        match self.run(task).await? {
            TaskOutput::TimeGrain(grain) => Ok(grain),
            _ => Err(QueryError::UnexpectedOutput("estimate_time_grain")),
        }
    }

    pub async fn estimate_rollup(
        &self,
        relation: &str,
        column: &str,
    ) -> Result<Option<RollupInterval>, QueryError> {
        let task = QueryTask::EstimateRollup {
            relation: relation.to_string(),
            column: column.to_string(),
        };
        match self.run(task).await? {
            TaskOutput::Rollup(interval) => Ok(interval),
            _ => Err(QueryError::UnexpectedOutput("estimate_rollup")),
        }
    }
}

impl Drop for QuerySession {
    fn drop(&mut self) {
        self.scheduler.end_session(&self.owner, self.generation);
    }
}

/// Keeps owners deprioritized while alive.
pub struct DeprioritizeGuard {
    scheduler: QueryScheduler,
    owners: Vec<String>,
}

impl Drop for DeprioritizeGuard {
    fn drop(&mut self) {
        self.scheduler.release_deprioritized(&self.owners);
    }
}
