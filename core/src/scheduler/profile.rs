//! Column profiling pipeline
//!
//! Two phases, both submitted through the caller's [`QuerySession`]:
//!
//! 1. [`describe`]: column listing plus preview rows. For models this is also
//!    what validates the query.
//! 2. [`summarize`]: row count, per-column null count and cardinality, and
//!    for [`ProfileScope::Full`] equal-width histograms of numeric columns.

use futures::future::try_join_all;

use super::engine::{quote_ident, ColumnInfo};
use super::histogram::compute_histogram;
use super::scheduler::QuerySession;
use crate::error::QueryError;
use crate::state::{ColumnSummary, ProfileScope, Row};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Described {
    pub columns: Vec<ColumnInfo>,
    pub preview: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Summary {
    pub cardinality: u64,
    pub columns: Vec<ColumnSummary>,
}

pub async fn describe(
    session: &QuerySession,
    relation: &str,
    preview_rows: usize,
) -> Result<Described, QueryError> {
    let result = session
        .execute(format!("SELECT * FROM {relation} LIMIT {preview_rows}"))
        .await?;
    Ok(Described {
        columns: result.columns,
        preview: result.rows,
    })
}

pub async fn summarize(
    session: &QuerySession,
    relation: &str,
    columns: &[ColumnInfo],
    scope: ProfileScope,
    histogram_buckets: usize,
) -> Result<Summary, QueryError> {
    let count = async {
        let result = session
            .execute(format!("SELECT count(*) AS count FROM {relation}"))
            .await?;
        Ok::<_, QueryError>(result.scalar_u64("count").unwrap_or(0))
    };

    let per_column = try_join_all(
        columns
            .iter()
            .map(|col| summarize_column(session, relation, col, scope, histogram_buckets)),
    );

    let (cardinality, columns) = futures::try_join!(count, per_column)?;
    Ok(Summary {
        cardinality,
        columns,
    })
}

async fn summarize_column(
    session: &QuerySession,
    relation: &str,
    column: &ColumnInfo,
    scope: ProfileScope,
    histogram_buckets: usize,
) -> Result<ColumnSummary, QueryError> {
    let col = quote_ident(&column.name);

    let stats = session
        .execute(format!(
            "SELECT count(*) - count({col}) AS null_count, count(DISTINCT {col}) AS cardinality FROM {relation}"
        ))
        .await?;

    let histogram = if scope == ProfileScope::Full && is_numeric_type(&column.data_type) {
        let values = session
            .execute(format!(
                "SELECT {col} AS value FROM {relation} WHERE {col} IS NOT NULL"
            ))
            .await?;
        Some(compute_histogram(
            &values.numeric_column("value"),
            histogram_buckets,
        ))
    } else {
        None
    };

    Ok(ColumnSummary {
        name: column.name.clone(),
        data_type: column.data_type.clone(),
        null_count: stats.scalar_u64("null_count").unwrap_or(0),
        cardinality: stats.scalar_u64("cardinality"),
        histogram,
    })
}

/// Engine type names that hold numbers.
pub fn is_numeric_type(data_type: &str) -> bool {
    let t = data_type.to_ascii_uppercase();
    ["INT", "REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL", "HUGEINT"]
        .iter()
        .any(|needle| t.contains(needle))
}
