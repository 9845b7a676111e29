//! Entity status transition rules

use super::types::EntityStatus;
use crate::error::TransitionError;

/// Entity status transitions
pub struct StateTransition;

impl StateTransition {
    /// Validate a status change on a derived record.
    pub fn validate(from: EntityStatus, to: EntityStatus) -> Result<(), TransitionError> {
        use EntityStatus::*;

        let is_valid = match (from, to) {
            (a, b) if a == b => true,

            // Any step may fail
            (_, Error) => true,

            // A settled entity starts a pipeline
            (Idle | Error, Importing | Validating | Profiling) => true,
            (Error, Idle) => true,

            // Pipeline steps advance
            (Importing | Validating, Profiling) => true,
            (Importing, Validating) => true,

            // A newer request restarts a running pipeline
            (Validating | Profiling | Exporting, Importing | Validating) => true,

            // Pipelines settle
            (Importing | Validating | Profiling, Idle) => true,

            (Idle, Exporting) | (Exporting, Idle) => true,

            _ => false,
        };

        if is_valid {
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition { from, to })
        }
    }

    /// Whether no pipeline step is in flight.
    pub fn is_settled(status: EntityStatus) -> bool {
        !status.is_busy()
    }

    pub fn status_description(status: EntityStatus) -> &'static str {
        match status {
            EntityStatus::Idle => "idle",
            EntityStatus::Importing => "importing source data",
            EntityStatus::Validating => "validating query",
            EntityStatus::Profiling => "profiling columns",
            EntityStatus::Exporting => "exporting results",
            EntityStatus::Error => "failed",
        }
    }
}
