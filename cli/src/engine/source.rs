//! Source file readers for `import-table`.
//!
//! CSV/TSV follow RFC 4180 quoting (doubled quotes inside quoted fields,
//! embedded delimiters and newlines). JSON is either an array of objects or
//! one object per line. Empty fields read as NULL.

use modelyard_core::api::{EngineError, SourceFormat};
use serde_json::Value;

/// Declared SQLite type of an imported column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// A parsed source with inferred column types.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    pub columns: Vec<(String, ColumnType)>,
    pub rows: Vec<Vec<Cell>>,
}

pub fn parse_source(text: &str, format: SourceFormat) -> Result<SourceTable, EngineError> {
    let (header, raw) = match format {
        SourceFormat::Csv => split_header(parse_delimited(text, ',')?)?,
        SourceFormat::Tsv => split_header(parse_delimited(text, '\t')?)?,
        SourceFormat::Json => parse_json(text)?,
    };
    Ok(infer(header, raw))
}

fn split_header(
    mut records: Vec<Vec<String>>,
) -> Result<(Vec<String>, Vec<Vec<Option<String>>>), EngineError> {
    if records.is_empty() {
        return Err(EngineError::Execution("source has no header row".into()));
    }
    let header = records.remove(0);
    let width = header.len();
    let rows = records
        .into_iter()
        // A trailing blank line is not a row.
        .filter(|r| !(r.len() == 1 && r[0].is_empty()))
        .map(|mut r| {
            r.resize(width, String::new());
            r.into_iter()
                .map(|f| (!f.is_empty()).then_some(f))
                .collect()
        })
        .collect();
    Ok((unique_names(header), rows))
}

/// Split delimited text into records.
pub fn parse_delimited(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, EngineError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.trim_start_matches('\u{feff}').chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(EngineError::Execution("unterminated quoted field".into()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

fn parse_json(text: &str) -> Result<(Vec<String>, Vec<Vec<Option<String>>>), EngineError> {
    let trimmed = text.trim_start();
    let objects: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| EngineError::Execution(e.to_string()))?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()
            .map_err(|e| EngineError::Execution(e.to_string()))?
    };

    let mut header: Vec<String> = Vec::new();
    for obj in &objects {
        let Value::Object(map) = obj else {
            return Err(EngineError::Execution("JSON rows must be objects".into()));
        };
        for key in map.keys() {
            if !header.contains(key) {
                header.push(key.clone());
            }
        }
    }

    let rows = objects
        .iter()
        .map(|obj| {
            header
                .iter()
                .map(|key| match obj.get(key) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => Some(other.to_string()),
                })
                .collect()
        })
        .collect();
    Ok((header, rows))
}

fn unique_names(header: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(header.len());
    for (i, name) in header.into_iter().enumerate() {
        let base = match name.trim() {
            "" => format!("column_{}", i + 1),
            n => n.to_string(),
        };
        let mut candidate = base.clone();
        let mut n = 2;
        while seen.contains(&candidate) {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        seen.push(candidate);
    }
    seen
}

fn infer(header: Vec<String>, raw: Vec<Vec<Option<String>>>) -> SourceTable {
    let types: Vec<ColumnType> = (0..header.len())
        .map(|i| {
            let mut values = raw.iter().filter_map(|r| r[i].as_deref()).peekable();
            if values.peek().is_none() {
                return ColumnType::Text;
            }
            let mut ty = ColumnType::Integer;
            for v in values {
                let v = v.trim();
                if ty == ColumnType::Integer && v.parse::<i64>().is_err() {
                    ty = ColumnType::Real;
                }
                if ty == ColumnType::Real && v.parse::<f64>().map_or(true, |f| !f.is_finite()) {
                    return ColumnType::Text;
                }
            }
            ty
        })
        .collect();

    let rows = raw
        .into_iter()
        .map(|r| {
            r.into_iter()
                .zip(&types)
                .map(|(v, ty)| match (v, ty) {
                    (None, _) => Cell::Null,
                    (Some(v), ColumnType::Integer) => {
                        v.trim().parse().map(Cell::Integer).unwrap_or(Cell::Text(v))
                    }
                    (Some(v), ColumnType::Real) => {
                        v.trim().parse().map(Cell::Real).unwrap_or(Cell::Text(v))
                    }
                    (Some(v), ColumnType::Text) => Cell::Text(v),
                })
                .collect()
        })
        .collect();

    SourceTable {
        columns: header.into_iter().zip(types).collect(),
        rows,
    }
}
