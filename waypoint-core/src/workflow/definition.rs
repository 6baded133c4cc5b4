//! Workflow definitions and their builder.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Result, WaypointError};
use crate::schema::Schema;
use crate::workflow::step::StepDefinition;

/// A committed, immutable chain of steps.
#[derive(Debug)]
pub struct Workflow {
    id: String,
    input_schema: Schema,
    output_schema: Schema,
    steps: Vec<StepDefinition>,
}

impl Workflow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }
}

pub struct WorkflowBuilder {
    id: String,
    input_schema: Schema,
    output_schema: Schema,
    steps: Vec<StepDefinition>,
}

/// Start a sequential workflow definition.
pub fn create_workflow(id: impl Into<String>, input_schema: Schema, output_schema: Schema) -> WorkflowBuilder {
    WorkflowBuilder {
        id: id.into(),
        input_schema,
        output_schema,
        steps: Vec::new(),
    }
}

impl WorkflowBuilder {
    pub fn then(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn commit(self) -> Result<Arc<Workflow>> {
        if self.steps.is_empty() {
            return Err(WaypointError::WorkflowDefinition {
                workflow_id: self.id,
                reason: "workflow has no steps".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WaypointError::WorkflowDefinition {
                    workflow_id: self.id.clone(),
                    reason: format!("duplicate step id '{}'", step.id),
                });
            }
        }

        tracing::debug!(workflow_id = %self.id, steps = self.steps.len(), "Workflow committed");
        Ok(Arc::new(Workflow {
            id: self.id,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            steps: self.steps,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::StepOutcome;

    fn echo(id: &str) -> StepDefinition {
        StepDefinition::from_fn(id, Schema::Any, Schema::Any, |ctx| async move {
            Ok(StepOutcome::Complete(ctx.input))
        })
    }

    #[test]
    fn test_commit_freezes_steps_in_order() {
        let wf = create_workflow("wf", Schema::Any, Schema::Any)
            .then(echo("a"))
            .then(echo("b"))
            .commit()
            .unwrap();
        let ids: Vec<&str> = wf.steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_workflow_is_rejected() {
        let err = create_workflow("wf", Schema::Any, Schema::Any).commit().unwrap_err();
        assert!(matches!(err, WaypointError::WorkflowDefinition { .. }));
    }

    #[test]
    fn test_duplicate_step_ids_are_rejected() {
        let err = create_workflow("wf", Schema::Any, Schema::Any)
            .then(echo("a"))
            .then(echo("a"))
            .commit()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'a'"));
    }
}
