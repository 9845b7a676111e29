//! Metrics definitions over a model, with their measures and dimensions.

use chrono::Utc;

use super::dispatcher::Dispatcher;
use super::registry::{
    ActionOutcome, AddDimensionArgs, AddMeasureArgs, CreateMetricsDefinitionArgs, IdArgs,
    UpdateMeasureArgs,
};
use crate::error::ActionError;
use crate::expr::{parse_expression, validate_measure};
use crate::scheduler::{model_relation, quote_ident, QuerySession};
use crate::state::{
    new_entity_id, DerivedDimension, DerivedMeasure, DerivedMetricsDefinition, DerivedModel,
    EntityStatus, PersistentDimension, PersistentMeasure, PersistentMetricsDefinition,
    PersistentModel,
};
use crate::util::sanitize_entity_name;

/// Parse and check a measure expression against the model's columns.
///
/// Returns the referenced columns (empty if the expression does not parse)
/// and the validation outcome.
fn check_measure(expression: &str, columns: &[String]) -> (Vec<String>, Result<(), String>) {
    let expr = match parse_expression(expression) {
        Ok(expr) => expr,
        Err(e) => {
            let (line, col) = e.line_col(expression);
            return (
                Vec::new(),
                Err(format!("{} (line {line}, column {col})", e)),
            );
        }
    };
    let referenced = expr.referenced_columns();
    let verdict = validate_measure(&expr, columns)
        .map(drop)
        .map_err(|e| e.to_string());
    (referenced, verdict)
}

fn has_column(columns: &[String], name: &str) -> bool {
    columns.iter().any(|c| c.eq_ignore_ascii_case(name))
}

impl Dispatcher {
    fn metrics_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PersistentMetricsDefinition>, ActionError> {
        Ok(self
            .inner
            .store
            .get_current_state::<PersistentMetricsDefinition>()?
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name)))
    }

    /// Profiled column names of a model.
    fn model_columns(&self, model_id: &str) -> Result<Vec<String>, ActionError> {
        Ok(self
            .derived::<DerivedModel>(model_id)?
            .profile
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    fn measures_of(&self, definition_id: &str) -> Result<Vec<PersistentMeasure>, ActionError> {
        Ok(self
            .inner
            .store
            .get_current_state::<PersistentMeasure>()?
            .into_iter()
            .filter(|m| m.metrics_definition_id == definition_id)
            .collect())
    }

    fn dimensions_of(&self, definition_id: &str) -> Result<Vec<PersistentDimension>, ActionError> {
        Ok(self
            .inner
            .store
            .get_current_state::<PersistentDimension>()?
            .into_iter()
            .filter(|d| d.metrics_definition_id == definition_id)
            .collect())
    }

    pub(super) fn create_metrics_definition(
        &self,
        args: CreateMetricsDefinitionArgs,
    ) -> Result<ActionOutcome, ActionError> {
        let name = args.name.trim().to_string();
        if name.is_empty() {
            return Err(ActionError::InvalidArgs {
                action: "createMetricsDefinition",
                message: "name must not be empty".into(),
            });
        }
        self.persistent::<PersistentModel>(&args.model_id)?;
        if self.metrics_definition_by_name(&name)?.is_some() {
            return Err(ActionError::AlreadyExists {
                kind: "metrics_definition",
                name,
            });
        }

        let now = Utc::now();
        let definition = PersistentMetricsDefinition {
            id: new_entity_id(),
            name,
            model_id: args.model_id,
            time_dimension: args.time_dimension.filter(|t| !t.trim().is_empty()),
            created_at: now,
            updated_at: now,
        };
        let id = definition.id.clone();
        self.create_entity::<PersistentMetricsDefinition, DerivedMetricsDefinition>(
            definition,
            EntityStatus::Idle,
        )?;
        Ok(ActionOutcome::completed(id))
    }

    /// Delete a definition together with its measures and dimensions.
    pub(super) fn delete_metrics_definition(
        &self,
        args: IdArgs,
    ) -> Result<ActionOutcome, ActionError> {
        self.persistent::<PersistentMetricsDefinition>(&args.id)?;
        for measure in self.measures_of(&args.id)? {
            self.remove_entity::<PersistentMeasure, DerivedMeasure>(&measure.id)?;
        }
        for dimension in self.dimensions_of(&args.id)? {
            self.remove_entity::<PersistentDimension, DerivedDimension>(&dimension.id)?;
        }
        self.remove_entity::<PersistentMetricsDefinition, DerivedMetricsDefinition>(&args.id)?;
        Ok(ActionOutcome::completed(args.id))
    }

    pub(super) fn add_measure(&self, args: AddMeasureArgs) -> Result<ActionOutcome, ActionError> {
        let definition =
            self.persistent::<PersistentMetricsDefinition>(&args.metrics_definition_id)?;
        let columns = self.model_columns(&definition.model_id)?;

        let label = args
            .label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| args.expression.trim().to_string());
        let sql_name = sanitize_entity_name(args.sql_name.as_deref().unwrap_or(&label));
        let measure = PersistentMeasure {
            id: new_entity_id(),
            metrics_definition_id: definition.id,
            label,
            expression: args.expression,
            sql_name,
        };
        let id = measure.id.clone();
        let expression = measure.expression.clone();

        self.create_entity::<PersistentMeasure, DerivedMeasure>(measure, EntityStatus::Validating)?;
        self.settle_measure(&id, &expression, &columns)
    }

    pub(super) fn update_measure(
        &self,
        args: UpdateMeasureArgs,
    ) -> Result<ActionOutcome, ActionError> {
        let measure = self.persistent::<PersistentMeasure>(&args.id)?;
        let definition =
            self.persistent::<PersistentMetricsDefinition>(&measure.metrics_definition_id)?;
        let columns = self.model_columns(&definition.model_id)?;

        self.set_status::<DerivedMeasure>(&args.id, EntityStatus::Validating, None)?;
        let expression = args.expression.unwrap_or(measure.expression);
        self.inner
            .store
            .update_entity::<PersistentMeasure, _>(&args.id, |m| {
                if let Some(label) = args.label {
                    m.label = label;
                }
                m.expression = expression.clone();
            })?;
        self.settle_measure(&args.id, &expression, &columns)
    }

    pub(super) fn delete_measure(&self, args: IdArgs) -> Result<ActionOutcome, ActionError> {
        self.persistent::<PersistentMeasure>(&args.id)?;
        self.remove_entity::<PersistentMeasure, DerivedMeasure>(&args.id)?;
        Ok(ActionOutcome::completed(args.id))
    }

    /// Record the outcome of checking a measure expression.
    fn settle_measure(
        &self,
        id: &str,
        expression: &str,
        columns: &[String],
    ) -> Result<ActionOutcome, ActionError> {
        let (referenced, verdict) = check_measure(expression, columns);
        let valid = verdict.is_ok();

        let _guard = self.status_guard();
        self.inner
            .store
            .update_entity::<DerivedMeasure, _>(id, |m| {
                m.referenced_columns = referenced;
                m.expression_is_valid = valid;
            })?;

        match verdict {
            Ok(()) => {
                self.write_status_locked::<DerivedMeasure>(id, EntityStatus::Idle, None)?;
                Ok(ActionOutcome::completed(id))
            }
            Err(error) => {
                self.write_status_locked::<DerivedMeasure>(
                    id,
                    EntityStatus::Error,
                    Some(error.clone()),
                )?;
                Ok(ActionOutcome::Failed {
                    id: id.to_string(),
                    error,
                })
            }
        }
    }

    /// Add a dimension and profile its cardinality.
    pub(super) async fn add_dimension(
        &self,
        args: AddDimensionArgs,
    ) -> Result<ActionOutcome, ActionError> {
        let column = args.column.trim().to_string();
        if column.is_empty() {
            return Err(ActionError::InvalidArgs {
                action: "addDimension",
                message: "column must not be empty".into(),
            });
        }
        let definition =
            self.persistent::<PersistentMetricsDefinition>(&args.metrics_definition_id)?;
        let model = self.derived::<DerivedModel>(&definition.model_id)?;

        let dimension = PersistentDimension {
            id: new_entity_id(),
            metrics_definition_id: definition.id,
            label: args
                .label
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| column.clone()),
            column: column.clone(),
        };
        let id = dimension.id.clone();

        let session = self
            .begin_new::<PersistentDimension, DerivedDimension>(dimension, EntityStatus::Profiling)?;
        let result = self.profile_dimension(&session, &id, &model, &column).await;
        self.finish_pipeline::<DerivedDimension>(&id, &session, result)
    }

    async fn profile_dimension(
        &self,
        session: &QuerySession,
        id: &str,
        model: &DerivedModel,
        column: &str,
    ) -> Result<(), ActionError> {
        if model.sanitized_query.is_empty() {
            return Err(ActionError::Validation(format!(
                "model '{}' has no query",
                model.id
            )));
        }
        let columns: Vec<String> = model.profile.iter().map(|c| c.name.clone()).collect();
        if !has_column(&columns, column) {
            return Err(ActionError::Validation(format!("unknown column '{column}'")));
        }

        let result = session
            .execute(format!(
                "SELECT count(DISTINCT {}) AS cardinality FROM {}",
                quote_ident(column),
                model_relation(&model.sanitized_query)
            ))
            .await?;
        let cardinality = result.scalar_u64("cardinality");

        self.commit(session, || {
            self.inner
                .store
                .update_entity::<DerivedDimension, _>(id, |d| d.cardinality = cardinality)?;
            Ok(())
        })
    }

    pub(super) fn delete_dimension(&self, args: IdArgs) -> Result<ActionOutcome, ActionError> {
        self.persistent::<PersistentDimension>(&args.id)?;
        self.remove_entity::<PersistentDimension, DerivedDimension>(&args.id)?;
        Ok(ActionOutcome::completed(args.id))
    }

    /// Re-check every measure and dimension of a definition and estimate the
    /// time grain and rollup interval of its time dimension.
    pub(super) async fn validate_metrics_definition(
        &self,
        args: IdArgs,
    ) -> Result<ActionOutcome, ActionError> {
        let definition = self.persistent::<PersistentMetricsDefinition>(&args.id)?;
        let model = self.derived::<DerivedModel>(&definition.model_id)?;

        let session = self.begin::<DerivedMetricsDefinition>(&args.id, EntityStatus::Validating)?;
        let result = self
            .run_metrics_validation(&session, &definition, &model)
            .await;
        self.finish_pipeline::<DerivedMetricsDefinition>(&args.id, &session, result)
    }

    async fn run_metrics_validation(
        &self,
        session: &QuerySession,
        definition: &PersistentMetricsDefinition,
        model: &DerivedModel,
    ) -> Result<(), ActionError> {
        if model.sanitized_query.is_empty() {
            return Err(ActionError::Validation(format!(
                "model '{}' has no query",
                model.id
            )));
        }
        let columns: Vec<String> = model.profile.iter().map(|c| c.name.clone()).collect();
        let mut problems = Vec::new();

        for measure in self.measures_of(&definition.id)? {
            if let ActionOutcome::Failed { error, .. } =
                self.settle_measure(&measure.id, &measure.expression, &columns)?
            {
                problems.push(format!("measure '{}': {error}", measure.label));
            }
        }
        for dimension in self.dimensions_of(&definition.id)? {
            if !has_column(&columns, &dimension.column) {
                problems.push(format!(
                    "dimension '{}': unknown column '{}'",
                    dimension.label, dimension.column
                ));
            }
        }

        if let Some(time) = definition.time_dimension.as_deref() {
            if has_column(&columns, time) {
                let relation = model_relation(&model.sanitized_query);
                let (grain, rollup) = futures::try_join!(
                    session.estimate_time_grain(&relation, time),
                    session.estimate_rollup(&relation, time),
                )?;
                self.commit(session, || {
                    self.inner
                        .store
                        .update_entity::<DerivedMetricsDefinition, _>(&definition.id, |d| {
                            d.smallest_time_grain = grain;
                            d.rollup_interval = rollup;
                        })?;
                    Ok(())
                })?;
            } else {
                problems.push(format!("time dimension: unknown column '{time}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ActionError::Validation(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_check_measure_ok() {
        let (referenced, verdict) = check_measure("sum(price) / count(*)", &cols(&["price"]));
        assert_eq!(referenced, vec!["price"]);
        assert!(verdict.is_ok());
    }

    #[test]
    fn test_check_measure_unknown_column() {
        let (referenced, verdict) = check_measure("sum(cost)", &cols(&["price"]));
        assert_eq!(referenced, vec!["cost"]);
        assert_eq!(verdict.unwrap_err(), "unknown column 'cost'");
    }

    #[test]
    fn test_check_measure_syntax_error_has_position() {
        let (referenced, verdict) = check_measure("sum(price", &cols(&["price"]));
        assert!(referenced.is_empty());
        assert!(verdict.unwrap_err().contains("line 1"));
    }
}
