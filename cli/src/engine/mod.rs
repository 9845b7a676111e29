//! SQLite-backed analytical engine used by the `modelyard` binary.
//!
//! One connection behind a mutex; every call runs on the blocking pool so the
//! scheduler's async workers never stall on SQLite.

pub mod source;

use async_trait::async_trait;
use modelyard_core::api::{
    AnalyticalEngine, ColumnInfo, EngineError, QueryResult, Row, SourceFormat,
};
use modelyard_core::scheduler::quote_ident;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use source::{parse_source, Cell};

pub struct SqliteEngine {
    conn: Arc<Mutex<Connection>>,
}

fn sql_err(e: rusqlite::Error) -> EngineError {
    EngineError::Execution(e.to_string())
}

impl SqliteEngine {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Io(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        tracing::debug!(path = %path.display(), "sqlite database opened");
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        Ok(Self::from_connection(
            Connection::open_in_memory().map_err(sql_err)?,
        ))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| EngineError::Execution(format!("engine task failed: {e}")))?
    }
}

#[async_trait]
impl AnalyticalEngine for SqliteEngine {
    async fn execute(&self, sql: &str) -> Result<QueryResult, EngineError> {
        let sql = sql.to_string();
        self.with_conn(move |conn| run_query(conn, &sql)).await
    }

    async fn load_source(
        &self,
        table: &str,
        path: &Path,
        format: SourceFormat,
    ) -> Result<u64, EngineError> {
        let table = table.to_string();
        let path: PathBuf = path.to_path_buf();
        self.with_conn(move |conn| {
            let bytes = std::fs::read(&path)
                .map_err(|e| EngineError::Io(format!("{}: {e}", path.display())))?;
            let text = String::from_utf8_lossy(&bytes);
            let source = parse_source(&text, format)?;
            let rows = source.rows.len();
            load_table(conn, &table, source)?;
            tracing::info!(table = %table, rows, bytes = bytes.len(), "source loaded");
            Ok(bytes.len() as u64)
        })
        .await
    }

    async fn drop_table(&self, table: &str) -> Result<(), EngineError> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
        self.with_conn(move |conn| conn.execute_batch(&sql).map_err(sql_err))
            .await
    }
}

fn run_query(conn: &Connection, sql: &str) -> Result<QueryResult, EngineError> {
    let mut stmt = conn.prepare(sql).map_err(sql_err)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut types: Vec<Option<&'static str>> = vec![None; names.len()];

    let mut rows = Vec::new();
    let mut cursor = stmt.query([]).map_err(sql_err)?;
    while let Some(row) = cursor.next().map_err(sql_err)? {
        let mut out = Row::new();
        for (i, name) in names.iter().enumerate() {
            let value = row.get_ref(i).map_err(sql_err)?;
            if types[i].is_none() {
                types[i] = sql_type(&value);
            }
            out.insert(name.clone(), to_json(value));
        }
        rows.push(out);
    }

    let columns = names
        .into_iter()
        .zip(types)
        .map(|(name, ty)| ColumnInfo::new(name, ty.unwrap_or("TEXT")))
        .collect();
    Ok(QueryResult { columns, rows })
}

fn sql_type(value: &ValueRef<'_>) -> Option<&'static str> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some("INTEGER"),
        ValueRef::Real(_) => Some("REAL"),
        ValueRef::Text(_) => Some("TEXT"),
        ValueRef::Blob(_) => Some("BLOB"),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}

fn load_table(
    conn: &mut Connection,
    table: &str,
    source: source::SourceTable,
) -> Result<(), EngineError> {
    let name = quote_ident(table);
    let columns = source
        .columns
        .iter()
        .map(|(col, ty)| format!("{} {}", quote_ident(col), ty.as_sql()))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; source.columns.len()].join(", ");

    let tx = conn.transaction().map_err(sql_err)?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {name}; CREATE TABLE {name} ({columns});"
    ))
    .map_err(sql_err)?;
    {
        let mut insert = tx
            .prepare(&format!("INSERT INTO {name} VALUES ({placeholders})"))
            .map_err(sql_err)?;
        for row in source.rows {
            let values = row.into_iter().map(|cell| match cell {
                Cell::Null => SqlValue::Null,
                Cell::Integer(i) => SqlValue::Integer(i),
                Cell::Real(f) => SqlValue::Real(f),
                Cell::Text(s) => SqlValue::Text(s),
            });
            insert.execute(params_from_iter(values)).map_err(sql_err)?;
        }
    }
    tx.commit().map_err(sql_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelyard_core::scheduler::{model_relation, table_relation};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    async fn loaded(csv: &str) -> (TempDir, SqliteEngine) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orders.csv");
        std::fs::write(&path, csv).unwrap();
        let engine = SqliteEngine::open(&dir.path().join("db/modelyard.db")).unwrap();
        let size = engine
            .load_source("orders", &path, SourceFormat::Csv)
            .await
            .unwrap();
        assert_eq!(size, csv.len() as u64);
        (dir, engine)
    }

    #[tokio::test]
    async fn test_load_and_profile_queries() {
        let (_dir, engine) =
            loaded("id,amount,region\n1,1,eu\n2,4,us\n3,7,\n").await;
        let rel = table_relation("orders");

        let count = engine
            .execute(&format!("SELECT count(*) AS count FROM {rel}"))
            .await
            .unwrap();
        assert_eq!(count.scalar_u64("count"), Some(3));

        let stats = engine
            .execute(&format!(
                "SELECT count(*) - count(\"region\") AS null_count, count(DISTINCT \"region\") AS cardinality FROM {rel}"
            ))
            .await
            .unwrap();
        assert_eq!(stats.scalar_u64("null_count"), Some(1));
        assert_eq!(stats.scalar_u64("cardinality"), Some(2));

        let preview = engine
            .execute(&format!("SELECT * FROM {rel} LIMIT 2"))
            .await
            .unwrap();
        assert_eq!(
            preview.columns,
            vec![
                ColumnInfo::new("id", "INTEGER"),
                ColumnInfo::new("amount", "INTEGER"),
                ColumnInfo::new("region", "TEXT"),
            ]
        );
        assert_eq!(preview.rows[1].get("region"), Some(&json!("us")));
    }

    #[tokio::test]
    async fn test_model_relation_and_errors() {
        let (_dir, engine) = loaded("id,amount\n1,1.5\n2,2.5\n").await;
        let result = engine
            .execute(&format!(
                "SELECT sum(amount) AS total FROM {}",
                model_relation("select * from orders where id > 1")
            ))
            .await
            .unwrap();
        assert_eq!(result.rows[0].get("total"), Some(&json!(2.5)));

        let err = engine.execute("select * from nowhere").await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[tokio::test]
    async fn test_reload_and_drop() {
        let (dir, engine) = loaded("id\n1\n2\n").await;
        let path = dir.path().join("orders.csv");
        std::fs::write(&path, "id,name\n9,x\n").unwrap();
        engine
            .load_source("orders", &path, SourceFormat::Csv)
            .await
            .unwrap();
        let rows = engine.execute("SELECT * FROM \"orders\"").await.unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(rows.columns.len(), 2);

        engine.drop_table("orders").await.unwrap();
        assert!(engine.execute("SELECT * FROM \"orders\"").await.is_err());
        // Dropping twice is fine.
        engine.drop_table("orders").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_source_is_io_error() {
        let engine = SqliteEngine::open_in_memory().unwrap();
        let err = engine
            .load_source("t", Path::new("/nonexistent/t.csv"), SourceFormat::Csv)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
