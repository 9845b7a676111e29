//! Measure validation against a model's columns.

use thiserror::Error;

use super::parser::Expr;

/// Functions that aggregate rows.
pub const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "median",
    "mode",
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "variance",
    "var_pop",
    "var_samp",
    "total",
    "group_concat",
    "approx_count_distinct",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeasureError {
    #[error("measure must aggregate, e.g. sum(x) or count(*)")]
    NoAggregate,
    #[error("unknown column '{0}'")]
    UnknownColumn(String),
    #[error("column '{0}' is used outside an aggregate")]
    BareColumn(String),
}

/// Result of a successful measure check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureCheck {
    pub referenced_columns: Vec<String>,
}

pub fn is_aggregate(name: &str) -> bool {
    AGGREGATE_FUNCTIONS
        .iter()
        .any(|f| f.eq_ignore_ascii_case(name))
}

/// Check that `expr` aggregates and only touches `columns` (case-insensitive).
pub fn validate_measure(expr: &Expr, columns: &[String]) -> Result<MeasureCheck, MeasureError> {
    let referenced = expr.referenced_columns();

    if let Some(unknown) = referenced
        .iter()
        .find(|c| !columns.iter().any(|known| known.eq_ignore_ascii_case(c)))
    {
        return Err(MeasureError::UnknownColumn(unknown.clone()));
    }

    let mut has_aggregate = false;
    check_bare(expr, false, &mut has_aggregate)?;
    if !has_aggregate {
        return Err(MeasureError::NoAggregate);
    }

    Ok(MeasureCheck {
        referenced_columns: referenced,
    })
}

fn check_bare(expr: &Expr, in_aggregate: bool, has_aggregate: &mut bool) -> Result<(), MeasureError> {
    match expr {
        Expr::Call { name, args, .. } => {
            let aggregate = is_aggregate(name);
            *has_aggregate |= aggregate;
            for arg in args {
                check_bare(arg, in_aggregate || aggregate, has_aggregate)?;
            }
            Ok(())
        }
        Expr::Binary { left, right, .. } => {
            check_bare(left, in_aggregate, has_aggregate)?;
            check_bare(right, in_aggregate, has_aggregate)
        }
        Expr::Unary { operand } => check_bare(operand, in_aggregate, has_aggregate),
        Expr::Identifier { name, .. } if !in_aggregate => {
            Err(MeasureError::BareColumn(name.clone()))
        }
        Expr::Identifier { .. } | Expr::Literal { .. } | Expr::Wildcard => Ok(()),
    }
}
