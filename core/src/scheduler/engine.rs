use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use super::estimate;
use crate::error::EngineError;
use crate::state::{RollupInterval, Row, SourceFormat, TimeGrain};

/// Sample size used when estimating a column's time grain.
const TIME_GRAIN_SAMPLE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Columns plus rows of one statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn first_row(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Non-negative integer in `column` of the first row.
    pub fn scalar_u64(&self, column: &str) -> Option<u64> {
        match self.first_row()?.get(column)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Every value of `column` that reads as a number.
    pub fn numeric_column(&self, column: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|row| match row.get(column)? {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .collect()
    }
}

/// The analytical SQL engine behind the scheduler.
///
/// Only the query scheduler calls into the engine. Relations are either a
/// quoted table name or a parenthesized model query (see [`table_relation`]
/// and [`model_relation`]).
#[async_trait]
pub trait AnalyticalEngine: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryResult, EngineError>;

    /// Create (or replace) `table` from a source file; returns its size in bytes.
    async fn load_source(
        &self,
        table: &str,
        path: &Path,
        format: SourceFormat,
    ) -> Result<u64, EngineError>;

    async fn drop_table(&self, table: &str) -> Result<(), EngineError>;

    async fn estimate_smallest_time_grain(
        &self,
        relation: &str,
        column: &str,
    ) -> Result<Option<TimeGrain>, EngineError> {
        let sql = format!(
            "SELECT DISTINCT {col} AS value FROM {relation} WHERE {col} IS NOT NULL LIMIT {TIME_GRAIN_SAMPLE}",
            col = quote_ident(column),
        );
        let result = self.execute(&sql).await?;
        let values: Vec<Value> = result
            .rows
            .iter()
            .filter_map(|row| row.get("value").cloned())
            .collect();
        Ok(estimate::smallest_time_grain(&values))
    }

    async fn estimate_ideal_rollup_interval(
        &self,
        relation: &str,
        column: &str,
    ) -> Result<Option<RollupInterval>, EngineError> {
        let sql = format!(
            "SELECT min({col}) AS min_value, max({col}) AS max_value FROM {relation}",
            col = quote_ident(column),
        );
        let result = self.execute(&sql).await?;
        let Some(row) = result.first_row() else {
            return Ok(None);
        };
        Ok(estimate::ideal_rollup_interval(
            row.get("min_value").unwrap_or(&Value::Null),
            row.get("max_value").unwrap_or(&Value::Null),
        ))
    }
}

/// Double-quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_relation(table: &str) -> String {
    quote_ident(table)
}

/// Wrap a sanitized model query so it can stand where a table name would.
pub fn model_relation(sanitized_query: &str) -> String {
    format!("({sanitized_query}) AS model_relation")
}
