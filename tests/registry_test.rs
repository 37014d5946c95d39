// Tests for tool registration and conflict resolution

use std::sync::Arc;

use async_trait::async_trait;
use runledger::tools::{
    DispatchContext, HandlerError, RegisterOutcome, RegistryError, SourceRanking, ToolCall,
    ToolDef, ToolHandler, ToolOutput, ToolRegistry, ToolSource,
};
use serde_json::json;

struct Named(&'static str);

#[async_trait]
impl ToolHandler for Named {
    async fn execute(&self, _ctx: &DispatchContext, _call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        Ok(ToolOutput::new(self.0))
    }
}

fn def(name: &str, source: ToolSource, priority: i32) -> ToolDef {
    ToolDef::new(name, "test tool", json!({"type": "object"}))
        .source(source)
        .priority(priority)
}

async fn resolved_by(registry: &ToolRegistry, name: &str) -> String {
    let tool = registry.resolve(name).unwrap();
    let output = tool
        .handler
        .execute(&DispatchContext::new("act"), &ToolCall::new("c", name, json!({})))
        .await
        .unwrap();
    output.summary
}

#[tokio::test]
async fn test_full_tie_is_a_conflict() {
    let registry = ToolRegistry::default();
    registry
        .register(def("grep", ToolSource::Mcp, 0), Arc::new(Named("first")))
        .unwrap();

    let err = registry
        .register(def("grep", ToolSource::Mcp, 0), Arc::new(Named("second")))
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::Conflict {
            name: "grep".into(),
            existing: "mcp".into()
        }
    );
    assert_eq!(resolved_by(&registry, "grep").await, "first");
}

#[tokio::test]
async fn test_priority_wins_over_source() {
    let registry = ToolRegistry::default();
    registry
        .register(def("grep", ToolSource::Builtin, 0), Arc::new(Named("builtin")))
        .unwrap();

    let outcome = registry
        .register(def("grep", ToolSource::Subagent, 5), Arc::new(Named("subagent")))
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Replaced);
    assert_eq!(resolved_by(&registry, "grep").await, "subagent");

    let outcome = registry
        .register(def("grep", ToolSource::Builtin, 1), Arc::new(Named("builtin again")))
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Ignored);
    assert_eq!(resolved_by(&registry, "grep").await, "subagent");
}

#[tokio::test]
async fn test_source_rank_breaks_priority_tie() {
    let registry = ToolRegistry::default();
    registry
        .register(def("grep", ToolSource::Skill, 0), Arc::new(Named("skill")))
        .unwrap();

    let outcome = registry
        .register(def("grep", ToolSource::Mcp, 0), Arc::new(Named("mcp")))
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Replaced);

    let outcome = registry
        .register(def("grep", ToolSource::Subagent, 0), Arc::new(Named("subagent")))
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Ignored);
    assert_eq!(resolved_by(&registry, "grep").await, "mcp");
}

#[tokio::test]
async fn test_custom_ranking() {
    let registry = ToolRegistry::new(SourceRanking(vec![ToolSource::Skill, ToolSource::Builtin]));
    registry
        .register(def("grep", ToolSource::Builtin, 0), Arc::new(Named("builtin")))
        .unwrap();
    registry
        .register(def("grep", ToolSource::Skill, 0), Arc::new(Named("skill")))
        .unwrap();
    assert_eq!(resolved_by(&registry, "grep").await, "skill");

    // unranked sources lose to every ranked one
    let outcome = registry
        .register(def("grep", ToolSource::Mcp, 0), Arc::new(Named("mcp")))
        .unwrap();
    assert_eq!(outcome, RegisterOutcome::Ignored);
}

#[test]
fn test_invalid_definitions() {
    let registry = ToolRegistry::default();

    let err = registry
        .register(def("", ToolSource::Builtin, 0), Arc::new(Named("x")))
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidDefinition(_)));

    let err = registry
        .register(def(" grep", ToolSource::Builtin, 0), Arc::new(Named("x")))
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidDefinition(_)));

    let bad_schema = ToolDef::new("grep", "test", json!("string"));
    let err = registry.register(bad_schema, Arc::new(Named("x"))).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidDefinition(_)));
    assert!(registry.is_empty());
}

#[test]
fn test_snapshot_and_unregister() {
    let registry = ToolRegistry::default();
    registry.register(def("b", ToolSource::Builtin, 0), Arc::new(Named("b"))).unwrap();
    registry.register(def("a", ToolSource::Builtin, 0), Arc::new(Named("a"))).unwrap();
    registry.register(def("z", ToolSource::Mcp, 9), Arc::new(Named("z"))).unwrap();

    let names: Vec<String> = registry.snapshot().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["z", "a", "b"]);

    let removed = registry.unregister("a").unwrap();
    assert_eq!(removed.name, "a");
    assert_eq!(registry.len(), 2);
    assert!(matches!(
        registry.unregister("a"),
        Err(RegistryError::UnknownTool(_))
    ));
}
