//! Built-in tools over the thread store

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::handler::{HandlerError, ToolHandler};
use super::registry::{RegistryError, ToolRegistry};
use super::types::{DispatchContext, ToolCall, ToolDef, ToolOutput, ToolSource};
use crate::db::repositories::{MemoryFilter, TodosReplace};
use crate::db::{
    Database, MemoryKind, MemoryRepository, MemoryScope, ThreadKey, TodosRepository,
    TranscriptRepository,
};
use crate::error::StoreError;

/// Messages scanned per page by `search_transcript`
const SEARCH_PAGE: usize = 200;
const DEFAULT_SEARCH_LIMIT: usize = 20;

fn scoped_key(ctx: &DispatchContext) -> Result<&ThreadKey, HandlerError> {
    ctx.run
        .as_ref()
        .map(|scope| &scope.key)
        .ok_or_else(|| HandlerError::failed("tool requires a thread scope"))
}

fn builtin(name: &str, description: &str, input_schema: Value) -> ToolDef {
    ToolDef::new(name, description, input_schema).source(ToolSource::Builtin)
}

pub fn builtin_tools() -> Vec<ToolDef> {
    vec![
        builtin(
            "read_todos",
            "Read the current todo list of this thread",
            json!({
                "type": "object",
                "properties": {}
            }),
        )
        .parallel_safe(true),
        builtin(
            "write_todos",
            "Replace the todo list of this thread",
            json!({
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "description": "The complete new todo list"
                    },
                    "expected_version": {
                        "type": "integer",
                        "description": "Version the list was read at; 0 when no list exists yet"
                    }
                },
                "required": ["todos", "expected_version"]
            }),
        )
        .mutating(true),
        builtin(
            "list_memory",
            "List remembered facts, decisions and blockers for this thread",
            json!({
                "type": "object",
                "properties": {
                    "scope": {
                        "type": "string",
                        "enum": ["working", "episodic", "long_term"],
                        "description": "Filter by memory scope"
                    },
                    "kind": {
                        "type": "string",
                        "enum": ["fact", "decision", "constraint", "blocker", "artifact"],
                        "description": "Filter by memory kind"
                    }
                }
            }),
        )
        .parallel_safe(true),
        builtin(
            "search_transcript",
            "Search earlier messages of this thread",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Case-insensitive text to look for"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of matches"
                    }
                },
                "required": ["query"]
            }),
        )
        .parallel_safe(true),
    ]
}

/// Register every built-in tool against `db`
pub fn register_builtin_tools(registry: &ToolRegistry, db: &Database) -> Result<(), RegistryError> {
    for def in builtin_tools() {
        let handler: Arc<dyn ToolHandler> = match def.name.as_str() {
            "read_todos" => Arc::new(ReadTodos(TodosRepository::new(db.clone()))),
            "write_todos" => Arc::new(WriteTodos(TodosRepository::new(db.clone()))),
            "list_memory" => Arc::new(ListMemory(MemoryRepository::new(db.clone()))),
            "search_transcript" => Arc::new(SearchTranscript(TranscriptRepository::new(db.clone()))),
            other => return Err(RegistryError::UnknownTool(other.to_string())),
        };
        registry.register(def, handler)?;
    }
    Ok(())
}

struct ReadTodos(TodosRepository);

#[async_trait]
impl ToolHandler for ReadTodos {
    async fn execute(&self, ctx: &DispatchContext, _call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        let key = scoped_key(ctx)?;
        let output = match self.0.get(key).await.map_err(anyhow::Error::from)? {
            Some(snapshot) => {
                let count = snapshot.todos.as_array().map_or(0, Vec::len);
                ToolOutput::new(format!("{} todos (version {})", count, snapshot.version))
                    .with_details(json!({ "version": snapshot.version, "todos": snapshot.todos }))
            }
            None => ToolOutput::new("No todos yet").with_details(json!({ "version": 0, "todos": [] })),
        };
        Ok(output)
    }
}

/// Whole-number versions only; `1.0` is accepted, `1.5` is not
fn expected_version(value: Option<&Value>) -> Result<Option<i64>, HandlerError> {
    let value = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => v,
    };
    if let Some(n) = value.as_i64() {
        return Ok(Some(n));
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Ok(Some(f as i64)),
        _ => Err(HandlerError::Failed(anyhow::Error::from(StoreError::invalid(format!(
            "expected_version must be a whole number, got {}",
            value
        ))))),
    }
}

struct WriteTodos(TodosRepository);

#[async_trait]
impl ToolHandler for WriteTodos {
    async fn execute(&self, ctx: &DispatchContext, call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        let key = scoped_key(ctx)?;
        let todos = call.args.get("todos").cloned().unwrap_or(Value::Null);
        let expected = expected_version(call.args.get("expected_version"))?;

        let snapshot = self
            .0
            .replace_snapshot(
                &TodosReplace {
                    key: key.clone(),
                    todos,
                    updated_by: Some(call.tool_name.clone()),
                },
                expected,
            )
            .await
            .map_err(anyhow::Error::from)?;

        Ok(ToolOutput::new(format!("Todos saved (version {})", snapshot.version))
            .with_details(json!({ "version": snapshot.version })))
    }
}

struct ListMemory(MemoryRepository);

#[async_trait]
impl ToolHandler for ListMemory {
    async fn execute(&self, ctx: &DispatchContext, call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        let key = scoped_key(ctx)?;
        let filter = MemoryFilter {
            scope: call.args.get("scope").and_then(Value::as_str).map(MemoryScope::normalize),
            kind: call.args.get("kind").and_then(Value::as_str).map(MemoryKind::normalize),
        };
        let items = self.0.list(key, &filter).await.map_err(anyhow::Error::from)?;

        let listed: Vec<Value> = items
            .iter()
            .map(|m| {
                json!({
                    "memory_id": m.memory_id,
                    "scope": m.scope.as_str(),
                    "kind": m.kind.as_str(),
                    "content": m.content,
                    "importance": m.importance,
                })
            })
            .collect();
        Ok(ToolOutput::new(format!("{} memory items", listed.len())).with_details(Value::Array(listed)))
    }
}

struct SearchTranscript(TranscriptRepository);

#[async_trait]
impl ToolHandler for SearchTranscript {
    async fn execute(&self, ctx: &DispatchContext, call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        let key = scoped_key(ctx)?;
        let query = call
            .args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if query.is_empty() {
            return Err(HandlerError::failed("query must not be empty"));
        }
        let limit = call
            .args
            .get("limit")
            .and_then(Value::as_f64)
            .map(|n| n.max(1.0) as usize)
            .unwrap_or(DEFAULT_SEARCH_LIMIT);

        let mut matches = Vec::new();
        let mut after = 0;
        'pages: loop {
            if ctx.is_cancelled() {
                return Err(HandlerError::Canceled);
            }
            let page = self
                .0
                .list_messages(key, Some(after), Some(SEARCH_PAGE))
                .await
                .map_err(anyhow::Error::from)?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;
            for message in &page {
                if message.text.to_lowercase().contains(&query) {
                    matches.push(json!({
                        "id": message.id,
                        "role": message.role,
                        "text": message.text,
                    }));
                    if matches.len() >= limit {
                        break 'pages;
                    }
                }
            }
            if page.len() < SEARCH_PAGE {
                break;
            }
        }

        Ok(ToolOutput::new(format!("{} matching messages", matches.len())).with_details(Value::Array(matches)))
    }
}
