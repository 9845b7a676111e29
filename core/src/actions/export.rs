use serde_json::Value;
use std::path::{Path, PathBuf};

use super::dispatcher::Dispatcher;
use super::model::export_owner;
use super::registry::{ActionOutcome, ExportFormat, ExportModelArgs};
use super::status::is_superseded;
use crate::error::ActionError;
use crate::scheduler::{model_relation, QueryResult, QuerySession};
use crate::state::{DerivedModel, EntityStatus, PersistentModel};

impl Dispatcher {
    /// Idle → Exporting → Idle. Writes the model's full result to `path`.
    ///
    /// Runs under its own scheduler owner. If the query is edited meanwhile
    /// the export still completes but leaves the status to the new pipeline.
    pub(super) async fn export_model(
        &self,
        args: ExportModelArgs,
    ) -> Result<ActionOutcome, ActionError> {
        let path = PathBuf::from(&args.path);
        let format = args
            .format
            .or_else(|| ExportFormat::from_path(&path))
            .unwrap_or_default();

        self.persistent::<PersistentModel>(&args.id)?;
        let model = self.derived::<DerivedModel>(&args.id)?;
        if model.sanitized_query.is_empty() {
            return Err(ActionError::Validation(format!(
                "model '{}' has no query to export",
                args.id
            )));
        }

        let priority = self.priority_for(&args.id);
        let session = {
            let _guard = self.status_guard();
            self.write_status_locked::<DerivedModel>(&args.id, EntityStatus::Exporting, None)?;
            self.inner.scheduler.session(&export_owner(&args.id), priority)
        };

        let result = write_export(&session, &model.sanitized_query, &path, format).await;

        let _guard = self.status_guard();
        if !session.is_current() {
            return Ok(ActionOutcome::Superseded { id: args.id });
        }
        let still_exporting = self
            .derived::<DerivedModel>(&args.id)
            .map(|m| m.status == EntityStatus::Exporting)?;

        match result {
            Ok(rows) => {
                let export_path = path.display().to_string();
                self.inner
                    .store
                    .update_entity::<DerivedModel, _>(&args.id, |m| {
                        m.export_path = Some(export_path)
                    })?;
                if still_exporting {
                    self.write_status_locked::<DerivedModel>(&args.id, EntityStatus::Idle, None)?;
                }
                tracing::info!(entity_id = %args.id, rows, path = %path.display(), "model exported");
                Ok(ActionOutcome::completed(args.id))
            }
            Err(e) if is_superseded(&e) => Ok(ActionOutcome::Superseded { id: args.id }),
            Err(e) => {
                let error = e.to_string();
                if still_exporting {
                    self.write_status_locked::<DerivedModel>(
                        &args.id,
                        EntityStatus::Error,
                        Some(error.clone()),
                    )?;
                }
                Ok(ActionOutcome::Failed { id: args.id, error })
            }
        }
    }
}

async fn write_export(
    session: &QuerySession,
    sanitized_query: &str,
    path: &Path,
    format: ExportFormat,
) -> Result<usize, ActionError> {
    let result = session
        .execute(format!("SELECT * FROM {}", model_relation(sanitized_query)))
        .await?;

    let body = match format {
        ExportFormat::Csv => encode_csv(&result),
        ExportFormat::Json => serde_json::to_string_pretty(&result.rows)?,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ActionError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(path, body)
        .await
        .map_err(|source| ActionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(result.rows.len())
}

/// RFC 4180 CSV with a header row.
pub(crate) fn encode_csv(result: &QueryResult) -> String {
    let columns: Vec<&str> = if result.columns.is_empty() {
        result
            .first_row()
            .map(|row| row.keys().map(String::as_str).collect())
            .unwrap_or_default()
    } else {
        result.columns.iter().map(|c| c.name.as_str()).collect()
    };

    let mut out = String::new();
    push_record(&mut out, columns.iter().map(|c| c.to_string()));
    for row in &result.rows {
        push_record(
            &mut out,
            columns.iter().map(|c| match row.get(*c) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }),
        );
    }
    out
}

fn push_record(out: &mut String, fields: impl Iterator<Item = String>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(&field);
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ColumnInfo;
    use crate::state::Row;
    use serde_json::json;

    #[test]
    fn test_encode_csv() {
        let mut row = Row::new();
        row.insert("name".into(), json!("Smith, \"Jo\""));
        row.insert("amount".into(), json!(12.5));
        row.insert("note".into(), Value::Null);
        let result = QueryResult {
            columns: vec![
                ColumnInfo::new("name", "TEXT"),
                ColumnInfo::new("amount", "REAL"),
                ColumnInfo::new("note", "TEXT"),
            ],
            rows: vec![row],
        };

        assert_eq!(
            encode_csv(&result),
            "name,amount,note\n\"Smith, \"\"Jo\"\"\",12.5,\n"
        );
    }

    #[test]
    fn test_encode_csv_without_rows() {
        let result = QueryResult {
            columns: vec![ColumnInfo::new("id", "INTEGER")],
            rows: vec![],
        };
        assert_eq!(encode_csv(&result), "id\n");
    }
}
