//! The in-memory workflow definition registry.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use cron::Schedule;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::ValidationError;
use crate::workflow::WorkflowDefinition;

/// Registry-level failures. Kept distinct from [`ValidationError`]
/// because these surface from `Registry` itself (lock poisoning),
/// not from a bad definition.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// See [`ValidationError`].
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The registry's internal lock was poisoned by a panicking holder.
    #[error("workflow registry lock poisoned")]
    Poisoned,
}

/// Holds every registered [`WorkflowDefinition`], keyed by id.
///
/// Registration is validated once, up front, so every later lookup can
/// assume the definition it returns is well-formed: unique step ids,
/// a parseable cron expression (if any), and an input schema (if any)
/// that accepts `{}` when paired with a cron schedule.
#[derive(Default)]
pub struct Registry {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register `definition`. Fails if the id is already
    /// registered, if two of its steps share an id, if its step list is
    /// empty, if its cron expression doesn't parse, or if a cron
    /// schedule is paired with an input schema that rejects `{}`.
    #[instrument(skip(self, definition), fields(workflow_id = definition.id()))]
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        validate(&definition)?;

        let mut definitions = self.definitions.write().map_err(|_| RegistryError::Poisoned)?;
        if definitions.contains_key(definition.id()) {
            return Err(ValidationError::DuplicateWorkflowId(definition.id().to_string()).into());
        }
        info!(workflow_id = definition.id(), "registered workflow");
        definitions.insert(definition.id().to_string(), Arc::new(definition));
        Ok(())
    }

    /// Drop the in-memory entry for `id`. Does not touch persisted runs.
    pub fn unregister_workflow(&self, id: &str) -> Result<(), RegistryError> {
        let mut definitions = self.definitions.write().map_err(|_| RegistryError::Poisoned)?;
        if definitions.remove(id).is_none() {
            warn!(workflow_id = id, "unregister_workflow: no such definition");
        }
        Ok(())
    }

    /// Drop every in-memory entry.
    pub fn unregister_all_workflows(&self) -> Result<(), RegistryError> {
        let mut definitions = self.definitions.write().map_err(|_| RegistryError::Poisoned)?;
        definitions.clear();
        Ok(())
    }

    /// Look up a definition by id.
    pub fn get(&self, id: &str) -> Result<Option<Arc<WorkflowDefinition>>, RegistryError> {
        let definitions = self.definitions.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(definitions.get(id).cloned())
    }

    /// Every registered definition, for cron fan-out and introspection.
    pub fn all(&self) -> Result<Vec<Arc<WorkflowDefinition>>, RegistryError> {
        let definitions = self.definitions.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(definitions.values().cloned().collect())
    }

    /// Number of registered definitions.
    pub fn len(&self) -> Result<usize, RegistryError> {
        let definitions = self.definitions.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(definitions.len())
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.len()? == 0)
    }
}

fn validate(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    if definition.steps().is_empty() {
        return Err(ValidationError::EmptyStepList(definition.id().to_string()));
    }

    let mut seen = std::collections::HashSet::new();
    for step in definition.steps() {
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId {
                workflow_id: definition.id().to_string(),
                step_id: step.id.clone(),
            });
        }
    }

    if let Some(cron) = &definition.options().cron {
        Schedule::from_str(&cron.expression).map_err(|source| ValidationError::InvalidCron {
            expression: cron.expression.clone(),
            source,
        })?;

        if cron.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ValidationError::InvalidTimezone {
                workflow_id: definition.id().to_string(),
                timezone: cron.timezone.clone(),
            });
        }

        if let Some(validator) = &definition.options().input_schema {
            if validator(&json!({})).is_err() {
                return Err(ValidationError::CronInputSchemaRejectsEmpty(
                    definition.id().to_string(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepKind;

    fn trivial_definition(id: &str) -> WorkflowDefinition {
        WorkflowDefinition::builder(id)
            .step("a", StepKind::Run)
            .handler(|ctx| {
                Box::pin(async move { Ok(ctx.input) })
            })
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let registry = Registry::new();
        registry.register_workflow(trivial_definition("w1")).unwrap();
        assert!(registry.get("w1").unwrap().is_some());
        assert_eq!(registry.len().unwrap(), 1);
    }

    #[test]
    fn duplicate_workflow_id_is_rejected() {
        let registry = Registry::new();
        registry.register_workflow(trivial_definition("w1")).unwrap();
        let err = registry.register_workflow(trivial_definition("w1")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ValidationError::DuplicateWorkflowId(_))
        ));
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let def = WorkflowDefinition::builder("w2")
            .step("a", StepKind::Run)
            .step("a", StepKind::Run)
            .handler(|ctx| {
                Box::pin(async move { Ok(ctx.input) })
            });
        let registry = Registry::new();
        let err = registry.register_workflow(def).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ValidationError::DuplicateStepId { .. })
        ));
    }

    #[test]
    fn empty_step_list_is_rejected() {
        let def = WorkflowDefinition::builder("w3").handler(|ctx| {
            Box::pin(async move { Ok(ctx.input) })
        });
        let registry = Registry::new();
        let err = registry.register_workflow(def).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ValidationError::EmptyStepList(_))
        ));
    }

    #[test]
    fn unregister_drops_the_entry() {
        let registry = Registry::new();
        registry.register_workflow(trivial_definition("w4")).unwrap();
        registry.unregister_workflow("w4").unwrap();
        assert!(registry.get("w4").unwrap().is_none());
    }

    #[test]
    fn cron_with_schema_rejecting_empty_input_is_rejected() {
        let def = WorkflowDefinition::builder("w5")
            .step("a", StepKind::Run)
            .options(
                crate::workflow::WorkflowOptions::new()
                    .with_cron("*/5 * * * * *", "UTC")
                    .with_input_schema(|v| {
                        if v.get("required").is_some() {
                            Ok(())
                        } else {
                            Err("missing required field".to_string())
                        }
                    }),
            )
            .handler(|ctx| {
                Box::pin(async move { Ok(ctx.input) })
            });
        let registry = Registry::new();
        let err = registry.register_workflow(def).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation(ValidationError::CronInputSchemaRejectsEmpty(_))
        ));
    }
}
