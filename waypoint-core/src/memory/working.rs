//! Working memory: one profile document per resource, patched field by field.
//!
//! Two document formats:
//! - **markdown**: `## SECTION` headings with `- field: value` lines. Patch keys
//!   address fields flat (`{"likes": ..}`) or section-qualified
//!   (`{"INTERESTS": {"likes": ..}}`). Unknown fields are appended to their
//!   section, `null` blanks a value. Lines are never removed.
//! - **json**: deep object merge, `null` removes a key. When a schema is
//!   configured the merged document must still validate against it.
//!
//! A patch that is not an object, or that would empty a non-empty document,
//! is rejected. Markdown values are flattened to one line so a patch can never
//! inject headings or field lines. Wholesale replacement only exists as [`WorkingMemoryManager::replace`].

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::WorkingMemoryConfig;
use crate::error::{Result, WaypointError};
use crate::memory::store::MemoryStore;
use crate::models::{WorkingMemory, WorkingMemoryFormat};
use crate::schema::Schema;

/// Section used for flat patch keys that match no existing field.
const NOTES_SECTION: &str = "NOTES";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("patch must be an object of field updates")]
    NotAnObject,

    #[error("patch would clear the whole document")]
    WouldClear,

    #[error("stored document is not valid JSON: {0}")]
    InvalidDocument(String),

    #[error("invalid field name {0:?}")]
    InvalidField(String),

    #[error("merged document violates the profile schema: {0}")]
    SchemaViolation(String),
}

impl MergeError {
    pub fn into_policy(self, resource_id: &str) -> WaypointError {
        WaypointError::WorkingMemoryPolicy {
            resource_id: resource_id.to_string(),
            reason: self.to_string(),
        }
    }
}

/// Merge `patch` into `content`. Pure; used by every store backend.
pub fn merge_document(
    format: WorkingMemoryFormat,
    content: &str,
    patch: &Value,
    schema: Option<&Schema>,
) -> Result<String, MergeError> {
    let patch = patch.as_object().ok_or(MergeError::NotAnObject)?;
    match format {
        WorkingMemoryFormat::Markdown => merge_markdown(content, patch),
        WorkingMemoryFormat::Json => merge_json(content, patch, schema),
    }
}

// ============================================================================
// Markdown
// ============================================================================

fn field_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s*[-*]\s+)([^:]+?)\s*:(.*)$").expect("valid regex"))
}

fn heading_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*#{2,}\s+(.+?)\s*$").expect("valid regex"))
}

/// Join the non-blank lines of `text` with spaces.
fn single_line(text: &str) -> String {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => single_line(s),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn render_line(prefix: &str, key: &str, value: &str) -> String {
    if value.is_empty() {
        format!("{prefix}{key}:")
    } else {
        format!("{prefix}{key}: {value}")
    }
}

fn field_name(key: &str) -> Result<String, MergeError> {
    let name = key.trim();
    if name.is_empty() || name.contains([':', '\r', '\n']) {
        return Err(MergeError::InvalidField(key.to_string()));
    }
    Ok(name.to_string())
}

fn section_name(key: &str) -> Result<String, MergeError> {
    let name = key.trim();
    if name.is_empty() || name.contains(['#', '\r', '\n']) {
        return Err(MergeError::InvalidField(key.to_string()));
    }
    Ok(name.to_string())
}

type FieldUpdate = (Option<String>, String, String);

/// Flatten a patch into `(section, field, value)` updates.
fn flatten(patch: &Map<String, Value>) -> Result<Vec<FieldUpdate>, MergeError> {
    let mut updates = Vec::new();
    for (key, value) in patch {
        match value {
            Value::Object(fields) => {
                let section = section_name(key)?;
                for (field, v) in fields {
                    updates.push((Some(section.clone()), field_name(field)?, render_value(v)));
                }
            }
            other => updates.push((None, field_name(key)?, render_value(other))),
        }
    }
    Ok(updates)
}

fn merge_markdown(content: &str, patch: &Map<String, Value>) -> Result<String, MergeError> {
    let updates = flatten(patch)?;
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    for (section, field, value) in updates {
        if let Some(index) = find_field(&lines, section.as_deref(), &field) {
            let caps = field_line()
                .captures(&lines[index])
                .map(|c| (c[1].to_string(), c[2].to_string()));
            if let Some((prefix, key)) = caps {
                lines[index] = render_line(&prefix, &key, &value);
            }
            continue;
        }

        let section = section.unwrap_or_else(|| NOTES_SECTION.to_string());
        let line = render_line("- ", &field, &value);
        match find_section_end(&lines, &section) {
            Some(at) => lines.insert(at, line),
            None => {
                if lines.last().is_some_and(|l| !l.trim().is_empty()) {
                    lines.push(String::new());
                }
                lines.push(format!("## {section}"));
                lines.push(line);
            }
        }
    }

    let mut out = lines.join("\n");
    if content.ends_with('\n') || content.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

fn find_field(lines: &[String], section: Option<&str>, field: &str) -> Option<usize> {
    let mut current: Option<String> = None;
    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = heading_line().captures(line) {
            current = Some(caps[1].to_string());
            continue;
        }
        let Some(caps) = field_line().captures(line) else {
            continue;
        };
        if !caps[2].trim().eq_ignore_ascii_case(field.trim()) {
            continue;
        }
        let in_section = match (section, &current) {
            (None, _) => true,
            (Some(wanted), Some(cur)) => cur.eq_ignore_ascii_case(wanted.trim()),
            (Some(_), None) => false,
        };
        if in_section {
            return Some(i);
        }
    }
    None
}

/// Index just after the last non-blank line of `section`.
fn find_section_end(lines: &[String], section: &str) -> Option<usize> {
    let start = lines.iter().position(|l| {
        heading_line()
            .captures(l)
            .is_some_and(|c| c[1].eq_ignore_ascii_case(section.trim()))
    })?;

    let mut end = start + 1;
    for (i, line) in lines.iter().enumerate().skip(start + 1) {
        if heading_line().is_match(line) || line.trim_start().starts_with("# ") {
            break;
        }
        if !line.trim().is_empty() {
            end = i + 1;
        }
    }
    Some(end)
}

// ============================================================================
// JSON
// ============================================================================

fn merge_json(
    content: &str,
    patch: &Map<String, Value>,
    schema: Option<&Schema>,
) -> Result<String, MergeError> {
    let mut doc = if content.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(MergeError::InvalidDocument("not an object".to_string())),
            Err(e) => return Err(MergeError::InvalidDocument(e.to_string())),
        }
    };

    let was_empty = doc.is_empty();
    deep_merge(&mut doc, patch);
    if doc.is_empty() && !was_empty {
        return Err(MergeError::WouldClear);
    }

    let mut merged = Value::Object(doc);
    if let Some(schema) = schema {
        merged = schema
            .validate(&merged)
            .map_err(|e| MergeError::SchemaViolation(e.to_string()))?;
    }

    serde_json::to_string_pretty(&merged).map_err(|e| MergeError::InvalidDocument(e.to_string()))
}

fn deep_merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(nested) => match target.get_mut(key) {
                Some(Value::Object(existing)) => deep_merge(existing, nested),
                _ => {
                    let mut fresh = Map::new();
                    deep_merge(&mut fresh, nested);
                    target.insert(key.clone(), Value::Object(fresh));
                }
            },
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Reads and patches working memory through a [`MemoryStore`].
#[derive(Clone)]
pub struct WorkingMemoryManager {
    store: Arc<dyn MemoryStore>,
    config: WorkingMemoryConfig,
}

impl WorkingMemoryManager {
    pub fn new(store: Arc<dyn MemoryStore>, config: WorkingMemoryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &WorkingMemoryConfig {
        &self.config
    }

    /// Current document, seeded from the template on first access.
    pub async fn read(&self, resource_id: &str) -> Result<WorkingMemory> {
        if let Some(doc) = self.store.get_working_memory(resource_id).await? {
            return Ok(doc);
        }
        self.store
            .init_working_memory(resource_id, self.config.format, self.config.template())
            .await
    }

    /// Merge an observed fact into the document.
    pub async fn update(&self, resource_id: &str, patch: &Value) -> Result<WorkingMemory> {
        if !patch.is_object() {
            return Err(MergeError::NotAnObject.into_policy(resource_id));
        }
        self.read(resource_id).await?;
        let doc = self
            .store
            .merge_working_memory(resource_id, patch, self.config.schema.as_ref())
            .await?;
        tracing::debug!(
            resource_id = %resource_id,
            version = doc.version,
            "Working memory updated"
        );
        Ok(doc)
    }

    /// Administrative overwrite. Not exposed to agents.
    pub async fn replace(&self, resource_id: &str, content: &str) -> Result<WorkingMemory> {
        tracing::warn!(resource_id = %resource_id, "Working memory replaced by administrator");
        self.store
            .replace_working_memory(resource_id, self.config.format, content)
            .await
    }
}
