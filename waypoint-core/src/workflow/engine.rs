//! Workflow engine: drives runs through their steps.
//!
//! Every boundary is validated:
//! - workflow input before a run exists (`InputSchemaViolation`)
//! - each step's input, output and suspend payload (`StepContractViolation`)
//! - the final output against the workflow output schema
//! - resume input against the persisted resume schema (`ResumeSchemaViolation`)
//!
//! The run snapshot is saved after every completed step, and a suspended run
//! is durable before `run`/`resume` return. A step that errors or panics, or a
//! checkpoint that cannot be written, leaves the run FAILED rather than RUNNING.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ContractStage, Result, WaypointError};
use crate::models::{RunStatus, StepRecord, SuspendState, WorkflowRun};
use crate::schema::ValidationError;
use crate::workflow::definition::Workflow;
use crate::workflow::step::{StepContext, StepDefinition, StepOutcome};
use crate::workflow::store::RunStore;

/// How a `run` or `resume` call ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        run_id: Uuid,
        output: Value,
    },
    Suspended {
        run_id: Uuid,
        step_id: String,
        payload: Value,
    },
    /// The run is persisted as FAILED; `error` says which step and why.
    Failed {
        run_id: Uuid,
        error: WaypointError,
    },
}

impl RunOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunOutcome::Completed { run_id, .. }
            | RunOutcome::Suspended { run_id, .. }
            | RunOutcome::Failed { run_id, .. } => *run_id,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed { .. } => RunStatus::Completed,
            RunOutcome::Suspended { .. } => RunStatus::Suspended,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    /// Turn a failed outcome into its error.
    pub fn into_result(self) -> Result<RunOutcome> {
        match self {
            RunOutcome::Failed { error, .. } => Err(error),
            other => Ok(other),
        }
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn RunStore>,
    workflows: HashMap<String, Arc<Workflow>>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            workflows: HashMap::new(),
        }
    }

    pub fn register(&mut self, workflow: Arc<Workflow>) {
        tracing::info!(workflow_id = %workflow.id(), "Workflow registered");
        self.workflows.insert(workflow.id().to_string(), workflow);
    }

    pub fn workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>> {
        self.workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WaypointError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Start a new run of `workflow_id`.
    pub async fn run(&self, workflow_id: &str, input: Value) -> Result<RunOutcome> {
        let workflow = self.workflow(workflow_id)?;
        let input = workflow
            .input_schema()
            .validate(&input)
            .map_err(|source| WaypointError::InputSchemaViolation {
                workflow_id: workflow_id.to_string(),
                source,
            })?;

        let run = WorkflowRun::new(workflow_id, input);
        self.store.save_run(&run).await?;
        tracing::info!(run_id = %run.id, workflow_id = %workflow_id, "Run started");

        self.drive(&workflow, run, None).await
    }

    /// Continue a suspended run with external input.
    pub async fn resume(&self, run_id: Uuid, input: Value) -> Result<RunOutcome> {
        let run = self.get_run(run_id).await?;
        let Some(suspended) = run.suspended.as_ref().filter(|_| run.status == RunStatus::Suspended) else {
            return Err(WaypointError::InvalidRunState {
                run_id,
                status: run.status,
                expected: RunStatus::Suspended,
            });
        };
        let workflow = self.workflow(&run.workflow_id)?;

        let resume_data = match &suspended.resume_schema {
            Some(schema) => schema
                .validate(&input)
                .map_err(|source| WaypointError::ResumeSchemaViolation {
                    run_id,
                    step_id: suspended.step_id.clone(),
                    source,
                })?,
            None => input,
        };

        let Some(claimed) = self.store.claim_suspended(run_id).await? else {
            let status = self
                .store
                .load_run(run_id)
                .await?
                .map(|r| r.status)
                .ok_or(WaypointError::RunNotFound(run_id))?;
            return Err(WaypointError::InvalidRunState {
                run_id,
                status,
                expected: RunStatus::Suspended,
            });
        };

        tracing::info!(run_id = %run_id, step_id = %suspended.step_id, "Run resumed");
        self.drive(&workflow, claimed, Some(resume_data)).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or(WaypointError::RunNotFound(run_id))
    }

    /// Fail a run from outside, e.g. when a human never answers.
    pub async fn mark_failed(&self, run_id: Uuid, reason: &str) -> Result<WorkflowRun> {
        let mut run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(WaypointError::InvalidRunState {
                run_id,
                status: run.status,
                expected: RunStatus::Suspended,
            });
        }

        run.status = RunStatus::Failed;
        run.error = Some(reason.to_string());
        run.suspended = None;
        run.touch();
        self.store.save_run(&run).await?;
        tracing::warn!(run_id = %run_id, reason = %reason, "Run marked failed");
        Ok(run)
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        mut run: WorkflowRun,
        mut resume_data: Option<Value>,
    ) -> Result<RunOutcome> {
        run.status = RunStatus::Running;
        run.suspended = None;
        run.touch();
        if let Err(e) = self.store.save_run(&run).await {
            return self.fail(run, e).await;
        }

        while let Some(step) = workflow.step(run.current_step) {
            let input = match step.input_schema.validate(&run.pending_input) {
                Ok(v) => v,
                Err(source) => {
                    let error = contract_violation_for(&run, step, ContractStage::Input, source);
                    return self.fail(run, error).await;
                }
            };

            let ctx = StepContext::new(
                run.id,
                step.id.clone(),
                input.clone(),
                run.init_data.clone(),
                resume_data.take(),
            );
            tracing::debug!(run_id = %run.id, step_id = %step.id, resumed = ctx.resume_data().is_some(), "Executing step");

            let executed = AssertUnwindSafe(step.executor.execute(ctx)).catch_unwind().await;
            let outcome = match executed {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    let error = WaypointError::StepFailed {
                        run_id: run.id,
                        step_id: step.id.clone(),
                        message: format!("{e:#}"),
                    };
                    return self.fail(run, error).await;
                }
                Err(panic) => {
                    let error = WaypointError::StepFailed {
                        run_id: run.id,
                        step_id: step.id.clone(),
                        message: format!("step panicked: {}", panic_message(&*panic)),
                    };
                    return self.fail(run, error).await;
                }
            };

            match outcome {
                StepOutcome::Complete(output) => {
                    let output = match step.output_schema.validate(&output) {
                        Ok(v) => v,
                        Err(source) => {
                            let error = contract_violation_for(&run, step, ContractStage::Output, source);
                            return self.fail(run, error).await;
                        }
                    };
                    run.steps.push(StepRecord {
                        step_id: step.id.clone(),
                        input,
                        output: output.clone(),
                    });
                    run.pending_input = output;
                    run.current_step += 1;
                    run.touch();
                    if let Err(e) = self.store.save_run(&run).await {
                        return self.fail(run, e).await;
                    }
                }
                StepOutcome::Suspend(payload) => {
                    let validated = match &step.suspend_schema {
                        Some(schema) => schema.validate(&payload),
                        None => Err(ValidationError::undeclared("suspend")),
                    };
                    let payload = match validated {
                        Ok(v) => v,
                        Err(source) => {
                            let error = contract_violation_for(&run, step, ContractStage::Suspend, source);
                            return self.fail(run, error).await;
                        }
                    };

                    run.status = RunStatus::Suspended;
                    run.suspended = Some(SuspendState {
                        step_id: step.id.clone(),
                        payload: payload.clone(),
                        resume_schema: step.resume_schema.clone(),
                        suspended_at: Utc::now(),
                    });
                    run.touch();
                    if let Err(e) = self.store.save_suspended_run(&run).await {
                        return self.fail(run, e).await;
                    }

                    tracing::info!(run_id = %run.id, step_id = %step.id, "Run suspended");
                    return Ok(RunOutcome::Suspended {
                        run_id: run.id,
                        step_id: step.id.clone(),
                        payload,
                    });
                }
            }
        }

        let output = match workflow.output_schema().validate(&run.pending_input) {
            Ok(v) => v,
            Err(source) => {
                let step_id = workflow
                    .steps()
                    .last()
                    .map(|s| s.id.clone())
                    .unwrap_or_default();
                let error = WaypointError::StepContractViolation {
                    run_id: run.id,
                    step_id,
                    stage: ContractStage::WorkflowOutput,
                    source,
                };
                return self.fail(run, error).await;
            }
        };

        run.status = RunStatus::Completed;
        run.output = Some(output.clone());
        run.touch();
        if let Err(e) = self.store.save_run(&run).await {
            run.output = None;
            return self.fail(run, e).await;
        }
        tracing::info!(run_id = %run.id, workflow_id = %run.workflow_id, "Run completed");

        Ok(RunOutcome::Completed {
            run_id: run.id,
            output,
        })
    }

    async fn fail(&self, mut run: WorkflowRun, error: WaypointError) -> Result<RunOutcome> {
        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        run.suspended = None;
        run.touch();
        self.store.save_run(&run).await?;

        tracing::warn!(
            run_id = %run.id,
            step_id = error.step_id().unwrap_or("-"),
            error = %error,
            "Run failed"
        );
        Ok(RunOutcome::Failed {
            run_id: run.id,
            error,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

fn contract_violation_for(
    run: &WorkflowRun,
    step: &StepDefinition,
    stage: ContractStage,
    source: ValidationError,
) -> WaypointError {
    WaypointError::StepContractViolation {
        run_id: run.id,
        step_id: step.id.clone(),
        stage,
        source,
    }
}
