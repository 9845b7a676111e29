#![allow(dead_code)]

use async_trait::async_trait;
use modelyard_core::actions::{DispatchSettings, Dispatcher};
use modelyard_core::error::EngineError;
use modelyard_core::scheduler::{AnalyticalEngine, ColumnInfo, QueryResult, QueryScheduler};
use modelyard_core::state::{
    EntityStateStore, PatchOp, PatchTarget, Row, SourceFormat, StreamKey, Subscription,
};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MODEL_RELATION_SUFFIX: &str = ") AS model_relation";

/// Columns plus rows served for one relation.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn new(columns: &[(&str, &str)], rows: Vec<Value>) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|(name, ty)| ColumnInfo::new(*name, *ty))
                .collect(),
            rows: rows
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
        }
    }

    fn values(&self, column: &str) -> Vec<Value> {
        self.rows
            .iter()
            .filter_map(|row| row.get(column).cloned())
            .filter(|v| !v.is_null())
            .collect()
    }
}

pub fn orders() -> Dataset {
    Dataset::new(
        &[
            ("id", "INTEGER"),
            ("amount", "DOUBLE"),
            ("region", "TEXT"),
            ("created_at", "TEXT"),
        ],
        vec![
            json!({"id": 1, "amount": 1.0, "region": "eu", "created_at": "2024-01-01"}),
            json!({"id": 2, "amount": 4.0, "region": "us", "created_at": "2024-01-02"}),
            json!({"id": 3, "amount": 7.0, "region": null, "created_at": "2024-01-03"}),
        ],
    )
}

pub fn single_column(name: &str, values: &[i64]) -> Dataset {
    Dataset::new(
        &[(name, "INTEGER")],
        values.iter().map(|v| json!({ name: v })).collect(),
    )
}

#[derive(Default)]
struct Script {
    sources: HashMap<String, Dataset>,
    tables: HashMap<String, Dataset>,
    relations: Vec<(String, Dataset)>,
    delays: Vec<(String, Duration)>,
    failures: Vec<(String, String)>,
}

/// In-process engine answering the statements the profiling pipeline issues.
///
/// Tables come from `load_source` of a registered source file; model
/// relations resolve to the most recently registered dataset whose needle
/// appears in the model query. Delays and failures are keyed by substrings of
/// the statement.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<Script>,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn source(&self, file_name: &str, dataset: Dataset) {
        self.script
            .lock()
            .unwrap()
            .sources
            .insert(file_name.to_string(), dataset);
    }

    pub fn relation(&self, needle: &str, dataset: Dataset) {
        self.script
            .lock()
            .unwrap()
            .relations
            .push((needle.to_string(), dataset));
    }

    pub fn delay(&self, needle: &str, delay: Duration) {
        self.script
            .lock()
            .unwrap()
            .delays
            .push((needle.to_string(), delay));
    }

    pub fn fail(&self, needle: &str, message: &str) {
        self.script
            .lock()
            .unwrap()
            .failures
            .push((needle.to_string(), message.to_string()));
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.script.lock().unwrap().tables.contains_key(name)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Statements in completion order.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    /// Index of the last finished statement containing `needle`.
    pub fn last_finished(&self, needle: &str) -> Option<usize> {
        self.finished().iter().rposition(|sql| sql.contains(needle))
    }

    fn evaluate(&self, sql: &str) -> Result<QueryResult, EngineError> {
        let (head, rest) = sql
            .split_once(" FROM ")
            .ok_or_else(|| EngineError::Execution(format!("no FROM clause: {sql}")))?;
        let (dataset, tail) = self.resolve(rest)?;

        let column = first_quoted(head);
        let one_row = |row: Value| -> Result<QueryResult, EngineError> {
            let row = match row {
                Value::Object(map) => map,
                _ => Row::new(),
            };
            Ok(QueryResult {
                columns: row.keys().map(|k| ColumnInfo::new(k, "BIGINT")).collect(),
                rows: vec![row],
            })
        };

        if head == "SELECT *" {
            let limit = tail
                .trim()
                .strip_prefix("LIMIT ")
                .and_then(|n| n.trim().parse::<usize>().ok())
                .unwrap_or(usize::MAX);
            return Ok(QueryResult {
                columns: dataset.columns.clone(),
                rows: dataset.rows.iter().take(limit).cloned().collect(),
            });
        }
        if head == "SELECT count(*) AS count" {
            return one_row(json!({"count": dataset.rows.len()}));
        }

        let column = column.ok_or_else(|| EngineError::Execution(format!("unsupported: {sql}")))?;
        let values = dataset.values(&column);
        let distinct: BTreeSet<String> = values.iter().map(Value::to_string).collect();

        if head.starts_with("SELECT count(*) - count(") {
            return one_row(json!({
                "null_count": dataset.rows.len() - values.len(),
                "cardinality": distinct.len(),
            }));
        }
        if head.starts_with("SELECT count(DISTINCT ") {
            return one_row(json!({"cardinality": distinct.len()}));
        }
        if head.starts_with("SELECT min(") {
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.to_string().cmp(&b.to_string()),
            });
            return one_row(json!({
                "min_value": sorted.first().cloned().unwrap_or(Value::Null),
                "max_value": sorted.last().cloned().unwrap_or(Value::Null),
            }));
        }
        if head.starts_with("SELECT DISTINCT ") || head.ends_with(" AS value") {
            let mut seen = BTreeSet::new();
            let rows = values
                .into_iter()
                .filter(|v| !head.starts_with("SELECT DISTINCT ") || seen.insert(v.to_string()))
                .map(|v| {
                    let mut row = Row::new();
                    row.insert("value".into(), v);
                    row
                })
                .collect();
            return Ok(QueryResult {
                columns: vec![ColumnInfo::new("value", "DOUBLE")],
                rows,
            });
        }
        Err(EngineError::Execution(format!("unsupported: {sql}")))
    }

    fn resolve<'a>(&self, rest: &'a str) -> Result<(Dataset, &'a str), EngineError> {
        let script = self.script.lock().unwrap();
        if let Some(inner) = rest.strip_prefix('(') {
            let end = inner
                .rfind(MODEL_RELATION_SUFFIX)
                .ok_or_else(|| EngineError::Execution(format!("bad relation: {rest}")))?;
            let query = &inner[..end];
            let tail = &inner[end + MODEL_RELATION_SUFFIX.len()..];
            let dataset = script
                .relations
                .iter()
                .rev()
                .find(|(needle, _)| query.contains(needle.as_str()))
                .map(|(_, d)| d.clone())
                .ok_or_else(|| EngineError::Execution(format!("no such relation: {query}")))?;
            return Ok((dataset, tail));
        }

        let name = first_quoted(rest)
            .ok_or_else(|| EngineError::Execution(format!("bad relation: {rest}")))?;
        let tail = &rest[name.len() + 2..];
        let dataset = script
            .tables
            .get(&name)
            .cloned()
            .ok_or_else(|| EngineError::Execution(format!("no such table: {name}")))?;
        Ok((dataset, tail))
    }
}

fn first_quoted(s: &str) -> Option<String> {
    let start = s.find('"')? + 1;
    let len = s[start..].find('"')?;
    Some(s[start..start + len].to_string())
}

#[async_trait]
impl AnalyticalEngine for ScriptedEngine {
    async fn execute(&self, sql: &str) -> Result<QueryResult, EngineError> {
        self.started.lock().unwrap().push(sql.to_string());

        let (delay, failure) = {
            let script = self.script.lock().unwrap();
            let delay = script
                .delays
                .iter()
                .find(|(needle, _)| sql.contains(needle.as_str()))
                .map(|(_, d)| *d);
            let failure = script
                .failures
                .iter()
                .find(|(needle, _)| sql.contains(needle.as_str()))
                .map(|(_, m)| m.clone());
            (delay, failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = match failure {
            Some(message) => Err(EngineError::Execution(message)),
            None => self.evaluate(sql),
        };
        self.finished.lock().unwrap().push(sql.to_string());
        result
    }

    async fn load_source(
        &self,
        table: &str,
        path: &Path,
        _format: SourceFormat,
    ) -> Result<u64, EngineError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let delay = self
            .script
            .lock()
            .unwrap()
            .delays
            .iter()
            .find(|(needle, _)| file_name.contains(needle.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock().unwrap();
        let dataset = script
            .sources
            .get(&file_name)
            .cloned()
            .ok_or_else(|| EngineError::Io(format!("{file_name}: no such file")))?;
        let size = dataset.rows.len() as u64 * 64;
        script.tables.insert(table.to_string(), dataset);
        Ok(size)
    }

    async fn drop_table(&self, table: &str) -> Result<(), EngineError> {
        self.script.lock().unwrap().tables.remove(table);
        Ok(())
    }
}

pub fn dispatcher(engine: Arc<ScriptedEngine>, max_concurrency: usize) -> Dispatcher {
    dispatcher_with(engine, max_concurrency, DispatchSettings::default())
}

pub fn dispatcher_with(
    engine: Arc<ScriptedEngine>,
    max_concurrency: usize,
    settings: DispatchSettings,
) -> Dispatcher {
    let scheduler = QueryScheduler::new(engine, max_concurrency);
    Dispatcher::new(EntityStateStore::new(), scheduler, settings)
}

/// Wait until the engine has started a statement containing `needle`.
pub async fn wait_started(engine: &ScriptedEngine, needle: &str) {
    for _ in 0..10_000 {
        if engine.started().iter().any(|sql| sql.contains(needle)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("no statement containing {needle:?} was started");
}

/// Records every status a stream's entities pass through.
pub struct StatusRecorder {
    seen: Arc<Mutex<Vec<(String, String)>>>,
    _sub: Subscription,
}

impl StatusRecorder {
    pub fn attach(store: &EntityStateStore, stream: StreamKey) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = store.subscribe_patches(move |event| {
            if event.stream != stream {
                return;
            }
            let mut seen = sink.lock().unwrap();
            for patch in &event.patches {
                let Ok(target) = patch.target() else {
                    continue;
                };
                let value = patch.value.as_ref();
                match (target, patch.op) {
                    (PatchTarget::Entity(id), PatchOp::Add | PatchOp::Replace) => {
                        if let Some(status) = value.and_then(|v| v.get("status")).and_then(Value::as_str) {
                            seen.push((id, status.to_string()));
                        }
                    }
                    (PatchTarget::Field(id, field), PatchOp::Replace) if field == "status" => {
                        if let Some(status) = value.and_then(Value::as_str) {
                            seen.push((id, status.to_string()));
                        }
                    }
                    _ => {}
                }
            }
        });
        Self { seen, _sub: sub }
    }

    /// Distinct consecutive statuses of `id`.
    pub fn statuses(&self, id: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (entity, status) in self.seen.lock().unwrap().iter() {
            if entity == id && out.last() != Some(status) {
                out.push(status.clone());
            }
        }
        out
    }

    /// Distinct consecutive statuses across the whole stream.
    pub fn all(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (_, status) in self.seen.lock().unwrap().iter() {
            if out.last() != Some(status) {
                out.push(status.clone());
            }
        }
        out
    }
}
