//! Tool registry
//!
//! Many readers resolve concurrently; registration takes the write lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::handler::ToolHandler;
use super::types::{SourceRanking, ToolDef};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Same name, priority and source rank as an existing tool
    #[error("Tool conflict: {name} is already registered by {existing} with the same priority")]
    Conflict { name: String, existing: String },

    #[error("Invalid tool definition: {0}")]
    InvalidDefinition(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// What a successful `register` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    /// Outranked and replaced the previous tool of that name
    Replaced,
    /// Outranked by the existing tool; nothing changed
    Ignored,
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub def: ToolDef,
    pub handler: Arc<dyn ToolHandler>,
}

pub struct ToolRegistry {
    ranking: SourceRanking,
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(SourceRanking::default())
    }
}

impl ToolRegistry {
    pub fn new(ranking: SourceRanking) -> Self {
        Self {
            ranking,
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn ranking(&self) -> &SourceRanking {
        &self.ranking
    }

    pub fn register(
        &self,
        def: ToolDef,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<RegisterOutcome, RegistryError> {
        let name = def.name.trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::InvalidDefinition("tool name is required".into()));
        }
        if name != def.name {
            return Err(RegistryError::InvalidDefinition(format!(
                "tool name '{}' has surrounding whitespace",
                def.name
            )));
        }
        if !(def.input_schema.is_object() || def.input_schema.is_null()) {
            return Err(RegistryError::InvalidDefinition(format!(
                "input schema of '{}' must be an object",
                name
            )));
        }

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);

        let outcome = match tools.get(&name) {
            None => RegisterOutcome::Inserted,
            Some(existing) => {
                let existing = &existing.def;
                if def.priority != existing.priority {
                    if def.priority > existing.priority {
                        RegisterOutcome::Replaced
                    } else {
                        RegisterOutcome::Ignored
                    }
                } else {
                    let new_rank = self.ranking.rank(def.source);
                    let old_rank = self.ranking.rank(existing.source);
                    if new_rank < old_rank {
                        RegisterOutcome::Replaced
                    } else if new_rank > old_rank {
                        RegisterOutcome::Ignored
                    } else {
                        return Err(RegistryError::Conflict {
                            name,
                            existing: existing.source.as_str().to_string(),
                        });
                    }
                }
            }
        };

        match outcome {
            RegisterOutcome::Ignored => {
                debug!("Tool {} from {} outranked, ignoring", name, def.source.as_str());
            }
            _ => {
                info!(
                    "Registered tool {} (source {}, priority {})",
                    name,
                    def.source.as_str(),
                    def.priority
                );
                tools.insert(name, RegisteredTool { def, handler });
            }
        }
        Ok(outcome)
    }

    pub fn unregister(&self, name: &str) -> Result<ToolDef, RegistryError> {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        tools
            .remove(name)
            .map(|t| t.def)
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub fn resolve(&self, name: &str) -> Option<RegisteredTool> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        tools.get(name).cloned()
    }

    /// All definitions, priority descending then name
    pub fn snapshot(&self) -> Vec<ToolDef> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut defs: Vec<ToolDef> = tools.values().map(|t| t.def.clone()).collect();
        defs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
