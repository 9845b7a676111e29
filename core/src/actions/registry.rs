//! Closed action registry and the `{action, args}` wire envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::ActionError;
use crate::state::{EntityId, EntityKind};

/// Wire names of every action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionName {
    InitProject,
    ImportTable,
    DropTable,
    ProfileTable,
    AddModel,
    UpdateModelQuery,
    UpdateModelName,
    DeleteModel,
    ExportModel,
    SetActiveEntity,
    ClearActiveEntity,
    CreateMetricsDefinition,
    DeleteMetricsDefinition,
    AddMeasure,
    UpdateMeasure,
    DeleteMeasure,
    AddDimension,
    DeleteDimension,
    ValidateMetricsDefinition,
}

impl ActionName {
    pub const ALL: [ActionName; 19] = [
        ActionName::InitProject,
        ActionName::ImportTable,
        ActionName::DropTable,
        ActionName::ProfileTable,
        ActionName::AddModel,
        ActionName::UpdateModelQuery,
        ActionName::UpdateModelName,
        ActionName::DeleteModel,
        ActionName::ExportModel,
        ActionName::SetActiveEntity,
        ActionName::ClearActiveEntity,
        ActionName::CreateMetricsDefinition,
        ActionName::DeleteMetricsDefinition,
        ActionName::AddMeasure,
        ActionName::UpdateMeasure,
        ActionName::DeleteMeasure,
        ActionName::AddDimension,
        ActionName::DeleteDimension,
        ActionName::ValidateMetricsDefinition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitProject => "initProject",
            Self::ImportTable => "importTable",
            Self::DropTable => "dropTable",
            Self::ProfileTable => "profileTable",
            Self::AddModel => "addModel",
            Self::UpdateModelQuery => "updateModelQuery",
            Self::UpdateModelName => "updateModelName",
            Self::DeleteModel => "deleteModel",
            Self::ExportModel => "exportModel",
            Self::SetActiveEntity => "setActiveEntity",
            Self::ClearActiveEntity => "clearActiveEntity",
            Self::CreateMetricsDefinition => "createMetricsDefinition",
            Self::DeleteMetricsDefinition => "deleteMetricsDefinition",
            Self::AddMeasure => "addMeasure",
            Self::UpdateMeasure => "updateMeasure",
            Self::DeleteMeasure => "deleteMeasure",
            Self::AddDimension => "addDimension",
            Self::DeleteDimension => "deleteDimension",
            Self::ValidateMetricsDefinition => "validateMetricsDefinition",
        }
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionName {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ActionError::UnknownAction(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Arguments of actions that only address an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdArgs {
    pub id: EntityId,
}

impl IdArgs {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitProjectArgs {
    pub project_path: String,
    #[serde(default)]
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTableArgs {
    pub path: String,
    /// Defaults to the sanitized file stem.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropTableArgs {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddModelArgs {
    pub name: String,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateModelQueryArgs {
    pub id: EntityId,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateModelNameArgs {
    pub id: EntityId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportModelArgs {
    pub id: EntityId,
    pub path: String,
    /// Inferred from the path extension when absent.
    #[serde(default)]
    pub format: Option<ExportFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetActiveEntityArgs {
    pub kind: EntityKind,
    pub id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMetricsDefinitionArgs {
    pub name: String,
    pub model_id: EntityId,
    #[serde(default)]
    pub time_dimension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMeasureArgs {
    pub metrics_definition_id: EntityId,
    pub expression: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub sql_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMeasureArgs {
    pub id: EntityId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDimensionArgs {
    pub metrics_definition_id: EntityId,
    pub column: String,
    #[serde(default)]
    pub label: Option<String>,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Every operation the dispatcher accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    InitProject(InitProjectArgs),
    ImportTable(ImportTableArgs),
    DropTable(DropTableArgs),
    ProfileTable(IdArgs),
    AddModel(AddModelArgs),
    UpdateModelQuery(UpdateModelQueryArgs),
    UpdateModelName(UpdateModelNameArgs),
    DeleteModel(IdArgs),
    ExportModel(ExportModelArgs),
    SetActiveEntity(SetActiveEntityArgs),
    ClearActiveEntity,
    CreateMetricsDefinition(CreateMetricsDefinitionArgs),
    DeleteMetricsDefinition(IdArgs),
    AddMeasure(AddMeasureArgs),
    UpdateMeasure(UpdateMeasureArgs),
    DeleteMeasure(IdArgs),
    AddDimension(AddDimensionArgs),
    DeleteDimension(IdArgs),
    ValidateMetricsDefinition(IdArgs),
}

impl Action {
    pub fn name(&self) -> ActionName {
        match self {
            Self::InitProject(_) => ActionName::InitProject,
            Self::ImportTable(_) => ActionName::ImportTable,
            Self::DropTable(_) => ActionName::DropTable,
            Self::ProfileTable(_) => ActionName::ProfileTable,
            Self::AddModel(_) => ActionName::AddModel,
            Self::UpdateModelQuery(_) => ActionName::UpdateModelQuery,
            Self::UpdateModelName(_) => ActionName::UpdateModelName,
            Self::DeleteModel(_) => ActionName::DeleteModel,
            Self::ExportModel(_) => ActionName::ExportModel,
            Self::SetActiveEntity(_) => ActionName::SetActiveEntity,
            Self::ClearActiveEntity => ActionName::ClearActiveEntity,
            Self::CreateMetricsDefinition(_) => ActionName::CreateMetricsDefinition,
            Self::DeleteMetricsDefinition(_) => ActionName::DeleteMetricsDefinition,
            Self::AddMeasure(_) => ActionName::AddMeasure,
            Self::UpdateMeasure(_) => ActionName::UpdateMeasure,
            Self::DeleteMeasure(_) => ActionName::DeleteMeasure,
            Self::AddDimension(_) => ActionName::AddDimension,
            Self::DeleteDimension(_) => ActionName::DeleteDimension,
            Self::ValidateMetricsDefinition(_) => ActionName::ValidateMetricsDefinition,
        }
    }

    /// Decode an action from its wire name and JSON arguments.
    pub fn from_wire(name: &str, args: Value) -> Result<Self, ActionError> {
        let name: ActionName = name.parse()?;
        let action = match name {
            ActionName::InitProject => Self::InitProject(decode_args(name, args)?),
            ActionName::ImportTable => Self::ImportTable(decode_args(name, args)?),
            ActionName::DropTable => Self::DropTable(decode_args(name, args)?),
            ActionName::ProfileTable => Self::ProfileTable(decode_args(name, args)?),
            ActionName::AddModel => Self::AddModel(decode_args(name, args)?),
            ActionName::UpdateModelQuery => Self::UpdateModelQuery(decode_args(name, args)?),
            ActionName::UpdateModelName => Self::UpdateModelName(decode_args(name, args)?),
            ActionName::DeleteModel => Self::DeleteModel(decode_args(name, args)?),
            ActionName::ExportModel => Self::ExportModel(decode_args(name, args)?),
            ActionName::SetActiveEntity => Self::SetActiveEntity(decode_args(name, args)?),
            ActionName::ClearActiveEntity => Self::ClearActiveEntity,
            ActionName::CreateMetricsDefinition => {
                Self::CreateMetricsDefinition(decode_args(name, args)?)
            }
            ActionName::DeleteMetricsDefinition => {
                Self::DeleteMetricsDefinition(decode_args(name, args)?)
            }
            ActionName::AddMeasure => Self::AddMeasure(decode_args(name, args)?),
            ActionName::UpdateMeasure => Self::UpdateMeasure(decode_args(name, args)?),
            ActionName::DeleteMeasure => Self::DeleteMeasure(decode_args(name, args)?),
            ActionName::AddDimension => Self::AddDimension(decode_args(name, args)?),
            ActionName::DeleteDimension => Self::DeleteDimension(decode_args(name, args)?),
            ActionName::ValidateMetricsDefinition => {
                Self::ValidateMetricsDefinition(decode_args(name, args)?)
            }
        };
        Ok(action)
    }

    /// Encode the action as a wire envelope.
    pub fn to_envelope(&self) -> Result<ActionEnvelope, serde_json::Error> {
        let args = match self {
            Self::InitProject(a) => serde_json::to_value(a)?,
            Self::ImportTable(a) => serde_json::to_value(a)?,
            Self::DropTable(a) => serde_json::to_value(a)?,
            Self::ProfileTable(a)
            | Self::DeleteModel(a)
            | Self::DeleteMetricsDefinition(a)
            | Self::DeleteMeasure(a)
            | Self::DeleteDimension(a)
            | Self::ValidateMetricsDefinition(a) => serde_json::to_value(a)?,
            Self::AddModel(a) => serde_json::to_value(a)?,
            Self::UpdateModelQuery(a) => serde_json::to_value(a)?,
            Self::UpdateModelName(a) => serde_json::to_value(a)?,
            Self::ExportModel(a) => serde_json::to_value(a)?,
            Self::SetActiveEntity(a) => serde_json::to_value(a)?,
            Self::ClearActiveEntity => Value::Object(Default::default()),
            Self::CreateMetricsDefinition(a) => serde_json::to_value(a)?,
            Self::AddMeasure(a) => serde_json::to_value(a)?,
            Self::UpdateMeasure(a) => serde_json::to_value(a)?,
            Self::AddDimension(a) => serde_json::to_value(a)?,
        };
        Ok(ActionEnvelope {
            action: self.name().as_str().to_string(),
            args,
        })
    }
}

fn decode_args<T: DeserializeOwned>(name: ActionName, args: Value) -> Result<T, ActionError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| ActionError::InvalidArgs {
        action: name.as_str(),
        message: e.to_string(),
    })
}

/// `{action, args}` message sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub action: String,
    #[serde(default)]
    pub args: Value,
}

impl ActionEnvelope {
    pub fn into_action(self) -> Result<Action, ActionError> {
        Action::from_wire(&self.action, self.args)
    }
}

/// Result of a dispatched action.
///
/// Failures of an entity's own pipeline are recorded on the entity and
/// reported as `Failed`; requests that could not be carried out at all are
/// returned as [`ActionError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ActionOutcome {
    Completed { id: Option<EntityId> },
    /// A newer request for the same entity took over.
    Superseded { id: EntityId },
    Failed { id: EntityId, error: String },
}

impl ActionOutcome {
    pub fn completed(id: impl Into<EntityId>) -> Self {
        Self::Completed {
            id: Some(id.into()),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Completed { id } => id.as_deref(),
            Self::Superseded { id } | Self::Failed { id, .. } => Some(id),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
