//! `travel-agent-workflow`: suggest destinations, wait for the traveller to
//! pick one, then write a plan for it.

use std::sync::Arc;

use serde_json::{json, Value};
use waypoint_core::models::NewMessage;
use waypoint_core::workflow::Workflow;
use waypoint_core::{
    create_workflow, Agent, Field, GenerateOptions, Schema, StepDefinition, StepOutcome,
};

pub const WORKFLOW_ID: &str = "travel-agent-workflow";

pub const GENERATE_SUGGESTIONS: &str = "generate-suggestions";
pub const HUMAN_INPUT: &str = "human-input";
pub const TRAVEL_PLANNER: &str = "travel-planner";

fn vacation_schema() -> Schema {
    Schema::object([Field::required("vacationDescription", Schema::String)
        .describe("The description of the vacation")])
}

fn suggestions_schema() -> Schema {
    Schema::object([Field::required("suggestions", Schema::array(Schema::String))])
}

fn selection_schema() -> Schema {
    Schema::object([
        Field::required("selection", Schema::String).describe("The selection of the user")
    ])
}

fn plan_schema() -> Schema {
    Schema::object([Field::required("travelPlan", Schema::String)])
}

/// Shape the model is asked to produce for suggestions.
fn model_suggestions_schema() -> Schema {
    Schema::object([Field::required(
        "suggestions",
        Schema::array(Schema::object([
            Field::required("location", Schema::String),
            Field::required("description", Schema::String),
        ])),
    )])
}

/// `location: description` lines from a validated suggestions object.
pub fn flatten_suggestions(object: &Value) -> Vec<String> {
    object["suggestions"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|s| {
                    format!(
                        "{}: {}",
                        s["location"].as_str().unwrap_or_default(),
                        s["description"].as_str().unwrap_or_default()
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn generate_suggestions(agent: Arc<Agent>) -> StepDefinition {
    StepDefinition::from_fn(
        GENERATE_SUGGESTIONS,
        vacation_schema(),
        suggestions_schema(),
        move |ctx| {
            let agent = agent.clone();
            async move {
                let description = ctx.input["vacationDescription"].as_str().unwrap_or_default();
                let result = agent
                    .generate(
                        vec![NewMessage::user(format!("Generate 3 suggestions for: {description}"))],
                        GenerateOptions::structured(model_suggestions_schema()),
                    )
                    .await?;
                let suggestions = result
                    .object
                    .as_ref()
                    .map(flatten_suggestions)
                    .unwrap_or_default();
                tracing::debug!(run_id = %ctx.run_id, count = suggestions.len(), "Generated suggestions");
                Ok(StepOutcome::Complete(json!({ "suggestions": suggestions })))
            }
        },
    )
}

fn human_input() -> StepDefinition {
    StepDefinition::from_fn(HUMAN_INPUT, suggestions_schema(), selection_schema(), |ctx| async move {
        let selection = ctx
            .resume_data()
            .and_then(|r| r["selection"].as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        match selection {
            Some(selection) => Ok(StepOutcome::Complete(json!({ "selection": selection }))),
            None => Ok(ctx.suspend(json!({ "suggestions": ctx.input["suggestions"] }))),
        }
    })
    .suspendable(suggestions_schema(), selection_schema())
}

fn travel_planner(agent: Arc<Agent>) -> StepDefinition {
    StepDefinition::from_fn(TRAVEL_PLANNER, selection_schema(), plan_schema(), move |ctx| {
        let agent = agent.clone();
        async move {
            let description = ctx.init_data()["vacationDescription"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let selection = ctx.input["selection"].as_str().unwrap_or_default().to_string();
            let result = agent
                .generate(
                    vec![NewMessage::assistant(description), NewMessage::user(selection)],
                    GenerateOptions::default(),
                )
                .await?;
            Ok(StepOutcome::Complete(json!({ "travelPlan": result.text })))
        }
    })
}

pub fn travel_agent_workflow(agent: Arc<Agent>) -> waypoint_core::Result<Arc<Workflow>> {
    create_workflow(WORKFLOW_ID, vacation_schema(), plan_schema())
        .then(generate_suggestions(agent.clone()))
        .then(human_input())
        .then(travel_planner(agent))
        .commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_suggestions() {
        let object = json!({"suggestions": [
            {"location": "Kyoto", "description": "temples and gardens"},
            {"location": "Sapporo", "description": "snow festival"}
        ]});
        assert_eq!(
            flatten_suggestions(&object),
            vec!["Kyoto: temples and gardens", "Sapporo: snow festival"]
        );
        assert!(flatten_suggestions(&json!({})).is_empty());
    }

    #[test]
    fn test_step_order() {
        let model = Arc::new(waypoint_core::agent::ScriptedModel::new([]));
        let agent = Arc::new(Agent::new("travelAgent", "", model));
        let workflow = travel_agent_workflow(agent).unwrap();
        let ids: Vec<&str> = workflow.steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![GENERATE_SUGGESTIONS, HUMAN_INPUT, TRAVEL_PLANNER]);
        assert!(workflow.steps()[1].resume_schema.is_some());
    }
}
