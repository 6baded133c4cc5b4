use serde_json::{json, Value};
use waypoint_core::ipc::{WaypointRequest, WaypointResponse};
use waypoint_core::models::NewMessage;
use waypoint_core::{GenerateOptions, RunOutcome, WaypointError};

use crate::app::App;

pub async fn handle_request(request: WaypointRequest, app: &App) -> WaypointResponse {
    if let WaypointRequest::Ping = request {
        return WaypointResponse::pong();
    }

    match dispatch(request, app).await {
        Ok(data) => WaypointResponse::ok(data),
        Err(e) => {
            tracing::warn!(kind = e.kind(), error = %e, "Request failed");
            WaypointResponse::from(&e)
        }
    }
}

async fn dispatch(request: WaypointRequest, app: &App) -> Result<Value, WaypointError> {
    match request {
        WaypointRequest::Ping => Ok(json!({"pong": true})),
        WaypointRequest::Health => health(app).await,
        WaypointRequest::StartRun { workflow_id, input } => {
            let outcome = app.engine.run(&workflow_id, input).await?;
            Ok(outcome_to_json(&outcome))
        }
        WaypointRequest::ResumeRun { run_id, input } => {
            let outcome = app.engine.resume(run_id, input).await?;
            Ok(outcome_to_json(&outcome))
        }
        WaypointRequest::GetRun { run_id } => {
            let run = app.engine.get_run(run_id).await?;
            Ok(serde_json::to_value(run)?)
        }
        WaypointRequest::FailRun { run_id, reason } => {
            let run = app.engine.mark_failed(run_id, &reason).await?;
            Ok(serde_json::to_value(run)?)
        }
        WaypointRequest::AssembleContext {
            resource_id,
            thread_id,
            message,
        } => {
            let bundle = app
                .memory
                .assemble_context(&resource_id, &thread_id, NewMessage::user(message))
                .await?;
            Ok(serde_json::to_value(bundle)?)
        }
        WaypointRequest::GetWorkingMemory { resource_id } => {
            let doc = app.memory.get_working_memory(&resource_id).await?;
            Ok(serde_json::to_value(doc)?)
        }
        WaypointRequest::MergeWorkingMemory { resource_id, patch } => {
            let doc = app.memory.update_working_memory(&resource_id, &patch).await?;
            Ok(serde_json::to_value(doc)?)
        }
        WaypointRequest::Generate {
            agent,
            messages,
            output_schema,
            resource_id,
            thread_id,
        } => {
            let agent = app.agent(&agent)?;
            let mut options = GenerateOptions {
                output_schema,
                memory: None,
            };
            if let (Some(resource_id), Some(thread_id)) = (resource_id, thread_id) {
                options = options.with_memory(resource_id, thread_id);
            }
            let result = agent.generate(messages, options).await?;
            Ok(serde_json::to_value(result)?)
        }
    }
}

async fn health(app: &App) -> Result<Value, WaypointError> {
    let Some(pool) = &app.pool else {
        return Ok(json!({
            "status": "healthy",
            "storage": "memory",
        }));
    };
    let pg_ver = waypoint_core::db::health_check(pool).await?;
    let vec_ver = waypoint_core::db::check_pgvector(pool).await?;
    Ok(json!({
        "status": "healthy",
        "storage": "postgresql",
        "postgresql": pg_ver,
        "pgvector": vec_ver,
    }))
}

/// Wire shape of a run outcome. A failed run is still a successful request.
pub fn outcome_to_json(outcome: &RunOutcome) -> Value {
    match outcome {
        RunOutcome::Completed { run_id, output } => json!({
            "run_id": run_id,
            "status": "completed",
            "output": output,
        }),
        RunOutcome::Suspended {
            run_id,
            step_id,
            payload,
        } => json!({
            "run_id": run_id,
            "status": "suspended",
            "step_id": step_id,
            "payload": payload,
        }),
        RunOutcome::Failed { run_id, error } => json!({
            "run_id": run_id,
            "status": "failed",
            "step_id": error.step_id(),
            "kind": error.kind(),
            "error": error.to_string(),
        }),
    }
}
