//! waypoint: command-line client for the Waypoint HTTP API
//!
//! # Subcommands
//! - `run <workflow> --input <json>`      : start a workflow run
//! - `resume <run-id> --input <json>`     : resume a suspended run
//! - `status <run-id>`                    : show a run snapshot
//! - `fail <run-id> [--reason <text>]`    : mark a run failed
//! - `memory show <resource>`             : print the working memory document
//! - `memory merge <resource> k=v ...`    : patch working memory fields
//! - `health`                             : show server health

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Map, Value};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8767";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "waypoint", version, about = "Waypoint workflow and memory CLI")]
struct Cli {
    /// Waypoint HTTP server URL (overrides WAYPOINT_HTTP_URL env var)
    #[arg(long, env = "WAYPOINT_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a workflow run
    Run {
        workflow: String,

        /// Workflow input as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,
    },

    /// Resume a suspended run
    Resume {
        run_id: String,

        /// Resume input as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,
    },

    /// Show a run
    Status { run_id: String },

    /// Mark a run failed
    Fail {
        run_id: String,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Inspect or patch working memory
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },

    /// Show server health
    Health,
}

#[derive(Debug, Subcommand)]
enum MemoryCommands {
    /// Print the working memory document for a resource
    Show { resource: String },

    /// Merge `field=value` pairs into a resource's working memory.
    /// An empty value blanks the field.
    Merge {
        resource: String,

        #[arg(required = true)]
        fields: Vec<String>,
    },
}

// ============================================================================
// Helpers
// ============================================================================

/// Error body returned by the server on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: Option<String>,
    kind: Option<String>,
    step_id: Option<String>,
}

fn parse_json_object(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw).with_context(|| format!("invalid JSON: {raw}"))?;
    if !value.is_object() {
        bail!("expected a JSON object, got: {raw}");
    }
    Ok(value)
}

/// `["likes=sushi", "name="]` → `{"likes": "sushi", "name": null}`
fn build_patch(fields: &[String]) -> anyhow::Result<Value> {
    let mut patch = Map::new();
    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            bail!("expected field=value, got: {field}");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("empty field name in: {field}");
        }
        let value = value.trim();
        let value = if value.is_empty() {
            Value::Null
        } else {
            Value::String(value.to_string())
        };
        patch.insert(key.to_string(), value);
    }
    Ok(Value::Object(patch))
}

fn format_outcome(body: &Value) -> String {
    let run_id = body["run_id"].as_str().unwrap_or("?");
    match body["status"].as_str().unwrap_or("unknown") {
        "suspended" => {
            let mut out = format!(
                "Run {run_id} suspended at step '{}'",
                body["step_id"].as_str().unwrap_or("?")
            );
            if let Some(suggestions) = body["payload"]["suggestions"].as_array() {
                for (i, s) in suggestions.iter().enumerate() {
                    out.push_str(&format!("\n  {}. {}", i + 1, s.as_str().unwrap_or_default()));
                }
            } else {
                out.push_str(&format!("\n{}", pretty(&body["payload"])));
            }
            out
        }
        "completed" => format!("Run {run_id} completed\n{}", pretty(&body["output"])),
        "failed" => format!(
            "Run {run_id} failed at step '{}': {}",
            body["step_id"].as_str().unwrap_or("?"),
            body["error"].as_str().unwrap_or("unknown error")
        ),
        other => format!("Run {run_id}: {other}"),
    }
}

fn format_run(run: &Value) -> String {
    let mut out = format!(
        "Run:       {}\nWorkflow:  {}\nStatus:    {}\nStep:      {}",
        run["id"].as_str().unwrap_or("?"),
        run["workflow_id"].as_str().unwrap_or("?"),
        run["status"].as_str().unwrap_or("?"),
        run["current_step"].as_u64().unwrap_or_default(),
    );
    if let Some(suspended) = run["suspended"].as_object() {
        out.push_str(&format!(
            "\nWaiting:   {}",
            suspended.get("step_id").and_then(Value::as_str).unwrap_or("?")
        ));
    }
    if let Some(error) = run["error"].as_str() {
        out.push_str(&format!("\nError:     {error}"));
    }
    if !run["output"].is_null() {
        out.push_str(&format!("\nOutput:\n{}", pretty(&run["output"])));
    }
    out
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    client: reqwest::blocking::Client,
    server: String,
}

impl Api {
    fn new(server: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            // workflow steps call the model, which can be slow
            .timeout(std::time::Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
        })
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> anyhow::Result<Value> {
        let resp = request
            .send()
            .with_context(|| format!("connection failed to {}", self.server))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json()?);
        }
        let text = resp.text().unwrap_or_default();
        match serde_json::from_str::<ApiError>(&text) {
            Ok(ApiError {
                error: Some(error),
                kind,
                step_id,
            }) => {
                let mut msg = format!("server returned {status}: {error}");
                if let Some(kind) = kind {
                    msg.push_str(&format!(" [{kind}]"));
                }
                if let Some(step_id) = step_id {
                    msg.push_str(&format!(" (step '{step_id}')"));
                }
                bail!(msg)
            }
            _ => bail!("server returned {status}: {text}"),
        }
    }

    fn get(&self, path: &str) -> anyhow::Result<Value> {
        self.send(self.client.get(format!("{}{}", self.server, path)))
    }

    fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.send(self.client.post(format!("{}{}", self.server, path)).json(body))
    }

    fn patch(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.send(self.client.patch(format!("{}{}", self.server, path)).json(body))
    }
}

fn execute(api: &Api, command: Commands, json: bool) -> anyhow::Result<()> {
    let (body, text) = match command {
        Commands::Run { workflow, input } => {
            let body = api.post(&format!("/workflows/{workflow}/runs"), &parse_json_object(&input)?)?;
            let text = format_outcome(&body);
            (body, text)
        }
        Commands::Resume { run_id, input } => {
            let body = api.post(&format!("/runs/{run_id}/resume"), &parse_json_object(&input)?)?;
            let text = format_outcome(&body);
            (body, text)
        }
        Commands::Status { run_id } => {
            let body = api.get(&format!("/runs/{run_id}"))?;
            let text = format_run(&body);
            (body, text)
        }
        Commands::Fail { run_id, reason } => {
            let body = api.post(&format!("/runs/{run_id}/fail"), &serde_json::json!({ "reason": reason }))?;
            let text = format_run(&body);
            (body, text)
        }
        Commands::Memory { command } => {
            let body = match command {
                MemoryCommands::Show { resource } => api.get(&format!("/memory/{resource}/working"))?,
                MemoryCommands::Merge { resource, fields } => {
                    api.patch(&format!("/memory/{resource}/working"), &build_patch(&fields)?)?
                }
            };
            let text = format!(
                "{}\n(version {})",
                body["content"].as_str().unwrap_or_default().trim_end(),
                body["version"].as_i64().unwrap_or_default()
            );
            (body, text)
        }
        Commands::Health => {
            let body = api.get("/health")?;
            let text = format!(
                "Waypoint server: {}\nVersion:         {}\nStorage:         {}\nSocket:          {}",
                body["status"].as_str().unwrap_or("unknown"),
                body["version"].as_str().unwrap_or("?"),
                body["storage"].as_str().unwrap_or("?"),
                body["socket"].as_str().unwrap_or("?"),
            );
            (body, text)
        }
    };

    if json {
        println!("{}", pretty(&body));
    } else {
        println!("{text}");
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let result = Api::new(&cli.server).and_then(|api| execute(&api, cli.command, cli.json));

    if let Err(e) = result {
        eprintln!("waypoint: {e:#}");
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
