//! Turns the evidence of a finished run into memory items
//!
//! Ids are content hashes, so extracting the same evidence twice upserts
//! the same rows. Blocker ids leave out the run and the failure detail:
//! a later success of the same tool finds and clears the blocker.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info};

use crate::db::repositories::{memory, span, ExecutionSpan, MemoryItem};
use crate::db::{now, Database, MemoryKind, MemoryScope, SpanKind, ThreadKey};
use crate::error::{StoreError, StoreResult};
use crate::ids::content_id;

/// Longest content kept on an extracted item
pub const MAX_CONTENT_CHARS: usize = 400;

const BLOCKER_STATUSES: &[&str] = &[
    "failed", "error", "timed_out", "timeout", "canceled", "cancelled", "aborted",
];
const SUCCESS_STATUSES: &[&str] = &["success", "succeeded", "completed", "ok"];
const COMPLETION_VALUES: &[&str] = &["task_complete", "completed", "done"];

/// Everything known about one run when it ends
#[derive(Debug, Clone)]
pub struct RunEvidence {
    pub key: ThreadKey,
    pub run_id: String,
    pub spans: Vec<ExecutionSpan>,
    pub final_summary: Option<String>,
    pub finalization: Option<String>,
    pub objective: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionPlan {
    pub upserts: Vec<MemoryItem>,
    pub deletes: Vec<String>,
}

impl ExtractionPlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Memory kind for a span status
pub fn classify_status(status: &str) -> MemoryKind {
    let status = status.trim().to_ascii_lowercase();
    if BLOCKER_STATUSES.contains(&status.as_str()) {
        MemoryKind::Blocker
    } else if SUCCESS_STATUSES.contains(&status.as_str()) {
        MemoryKind::Fact
    } else {
        MemoryKind::Artifact
    }
}

pub fn is_completion(finalization: &str) -> bool {
    COMPLETION_VALUES.contains(&finalization.trim().to_ascii_lowercase().as_str())
}

/// Tool name for tool spans, otherwise the span kind
fn evidence_key(span: &ExecutionSpan) -> String {
    let name = span.name.trim();
    if span.kind == SpanKind::Tool && !name.is_empty() {
        name.to_string()
    } else {
        span.kind.as_str().to_string()
    }
}

pub fn blocker_id(key: &ThreadKey, tool_key: &str) -> String {
    content_id("mem", &[&key.endpoint_id, &key.thread_id, "blocker", tool_key])
}

fn truncate(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_CONTENT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_CONTENT_CHARS - 3).collect();
    format!("{}...", cut)
}

/// Short human detail out of a span payload
fn payload_detail(payload: Option<&Value>) -> Option<String> {
    let payload = payload?;
    let from_error = payload
        .get("error")
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(Value::as_str);
    let detail = from_error
        .or_else(|| payload.get("summary").and_then(Value::as_str))
        .or_else(|| payload.as_str())?;
    let detail = detail.trim();
    (!detail.is_empty()).then(|| detail.to_string())
}

struct ItemDraft {
    memory_id: String,
    scope: MemoryScope,
    kind: MemoryKind,
    content: String,
    importance: f64,
    freshness: f64,
    confidence: f64,
}

fn item(evidence: &RunEvidence, draft: ItemDraft) -> MemoryItem {
    let ts = now();
    MemoryItem {
        memory_id: draft.memory_id,
        endpoint_id: evidence.key.endpoint_id.clone(),
        thread_id: evidence.key.thread_id.clone(),
        scope: draft.scope,
        kind: draft.kind,
        content: truncate(&draft.content),
        importance: draft.importance,
        freshness: draft.freshness,
        confidence: draft.confidence,
        source_run_id: Some(evidence.run_id.clone()),
        created_at: ts,
        updated_at: ts,
    }
}

/// Build the memory changes for a run. Pure; `MemoryExtractor` applies them.
pub fn plan_extraction(evidence: &RunEvidence) -> ExtractionPlan {
    let key = &evidence.key;
    // memory_id -> item, so repeated evidence collapses to one row
    let mut upserts: BTreeMap<String, MemoryItem> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut deletes: Vec<String> = Vec::new();

    let mut push = |upserts: &mut BTreeMap<String, MemoryItem>, item: MemoryItem| {
        if !upserts.contains_key(&item.memory_id) {
            order.push(item.memory_id.clone());
        }
        upserts.insert(item.memory_id.clone(), item);
    };

    let spans = evidence
        .spans
        .iter()
        .filter(|s| s.run_id.as_deref() == Some(evidence.run_id.as_str()));

    for span in spans {
        let tool_key = evidence_key(span);
        let detail = payload_detail(span.payload.as_ref());

        match classify_status(&span.status) {
            MemoryKind::Blocker => {
                let id = blocker_id(key, &tool_key);
                deletes.retain(|d| d != &id);
                let content = match &detail {
                    Some(d) => format!("Tool blocked: {} ({}): {}", tool_key, span.status, d),
                    None => format!("Tool blocked: {} ({})", tool_key, span.status),
                };
                push(
                    &mut upserts,
                    item(
                        evidence,
                        ItemDraft {
                            memory_id: id,
                            scope: MemoryScope::Working,
                            kind: MemoryKind::Blocker,
                            content,
                            importance: 0.9,
                            freshness: 1.0,
                            confidence: 0.8,
                        },
                    ),
                );
            }
            MemoryKind::Fact => {
                let id = blocker_id(key, &tool_key);
                if upserts.remove(&id).is_some() {
                    debug!("Blocker on {} cleared by later success in run {}", tool_key, evidence.run_id);
                }
                if !deletes.contains(&id) {
                    deletes.push(id);
                }

                let content = match &detail {
                    Some(d) => format!("{} succeeded: {}", tool_key, d),
                    None => format!("{} succeeded", tool_key),
                };
                push(
                    &mut upserts,
                    item(
                        evidence,
                        ItemDraft {
                            memory_id: content_id(
                                "mem",
                                &[&key.endpoint_id, &key.thread_id, "fact", &tool_key, &content],
                            ),
                            scope: MemoryScope::Episodic,
                            kind: MemoryKind::Fact,
                            content,
                            importance: 0.5,
                            freshness: 0.9,
                            confidence: 0.9,
                        },
                    ),
                );
            }
            _ => {
                let content = match &detail {
                    Some(d) => format!("{} {}: {}", tool_key, span.status, d),
                    None => format!("{} {}", tool_key, span.status),
                };
                push(
                    &mut upserts,
                    item(
                        evidence,
                        ItemDraft {
                            memory_id: content_id(
                                "mem",
                                &[&key.endpoint_id, &key.thread_id, "artifact", &tool_key, &content],
                            ),
                            scope: MemoryScope::Episodic,
                            kind: MemoryKind::Artifact,
                            content,
                            importance: 0.3,
                            freshness: 0.8,
                            confidence: 0.6,
                        },
                    ),
                );
            }
        }
    }

    if let Some(summary) = evidence.final_summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let completed = evidence.finalization.as_deref().is_some_and(is_completion);
        let (scope, kind, importance, confidence) = if completed {
            (MemoryScope::LongTerm, MemoryKind::Decision, 0.8, 0.9)
        } else {
            (MemoryScope::Episodic, MemoryKind::Artifact, 0.5, 0.6)
        };
        push(
            &mut upserts,
            item(
                evidence,
                ItemDraft {
                    memory_id: content_id(
                        "mem",
                        &[&key.endpoint_id, &key.thread_id, "summary", &evidence.run_id, summary],
                    ),
                    scope,
                    kind,
                    content: summary.to_string(),
                    importance,
                    freshness: 1.0,
                    confidence,
                },
            ),
        );
    }

    if let Some(objective) = evidence.objective.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        push(
            &mut upserts,
            item(
                evidence,
                ItemDraft {
                    memory_id: content_id("mem", &[&key.endpoint_id, &key.thread_id, "objective", objective]),
                    scope: MemoryScope::Working,
                    kind: MemoryKind::Constraint,
                    content: format!("Objective: {}", objective),
                    importance: 0.95,
                    freshness: 1.0,
                    confidence: 1.0,
                },
            ),
        );
    }

    let upserts = order
        .into_iter()
        .filter_map(|id| upserts.remove(&id))
        .filter(|item| !deletes.contains(&item.memory_id))
        .collect();

    ExtractionPlan { upserts, deletes }
}

/// Counts from applying a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionOutcome {
    pub upserted: usize,
    pub deleted: usize,
}

pub struct MemoryExtractor {
    db: Database,
}

impl MemoryExtractor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Plan and apply in one transaction
    pub async fn apply(&self, evidence: &RunEvidence) -> StoreResult<ExtractionOutcome> {
        evidence.key.validate()?;
        let mut conn = self.db.conn().await?;
        let tx = conn.transaction()?;
        let outcome = apply_in(&tx, evidence)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Load the run's stored spans, then extract
    pub async fn extract_run(
        &self,
        key: &ThreadKey,
        run_id: &str,
        final_summary: Option<String>,
        finalization: Option<String>,
        objective: Option<String>,
    ) -> StoreResult<ExtractionOutcome> {
        key.validate()?;
        let mut conn = self.db.conn().await?;
        let tx = conn.transaction()?;
        let outcome = self.extract_run_in(&tx, key, run_id, final_summary, finalization, objective)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// `extract_run` against a connection the caller holds, usually an open
    /// transaction that also records the end of the run
    pub(crate) fn extract_run_in(
        &self,
        conn: &Connection,
        key: &ThreadKey,
        run_id: &str,
        final_summary: Option<String>,
        finalization: Option<String>,
        objective: Option<String>,
    ) -> StoreResult<ExtractionOutcome> {
        let spans = span::list_in(conn, key, Some(run_id))?;
        apply_in(
            conn,
            &RunEvidence {
                key: key.clone(),
                run_id: run_id.to_string(),
                spans,
                final_summary,
                finalization,
                objective,
            },
        )
    }
}

fn apply_in(conn: &Connection, evidence: &RunEvidence) -> StoreResult<ExtractionOutcome> {
    if evidence.run_id.trim().is_empty() {
        return Err(StoreError::invalid("run_id is required"));
    }
    let plan = plan_extraction(evidence);
    if plan.is_empty() {
        return Ok(ExtractionOutcome::default());
    }
    let (upserted, deleted) = memory::apply_in(conn, &evidence.key, &plan.upserts, &plan.deletes)?;
    info!(
        "Extracted memory for run {} on {}: {} upserted, {} deleted",
        evidence.run_id, evidence.key, upserted, deleted
    );
    Ok(ExtractionOutcome { upserted, deleted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> ThreadKey {
        ThreadKey::new("local", "t1").unwrap()
    }

    fn span(id: &str, name: &str, status: &str, payload: Option<Value>) -> ExecutionSpan {
        let ts = now();
        ExecutionSpan {
            span_id: id.into(),
            endpoint_id: "local".into(),
            thread_id: "t1".into(),
            run_id: Some("run-1".into()),
            kind: SpanKind::Tool,
            name: name.into(),
            status: status.into(),
            payload,
            started_at: ts,
            ended_at: Some(ts),
            updated_at: ts,
        }
    }

    fn evidence(spans: Vec<ExecutionSpan>) -> RunEvidence {
        RunEvidence {
            key: key(),
            run_id: "run-1".into(),
            spans,
            final_summary: None,
            finalization: None,
            objective: None,
        }
    }

    #[test]
    fn status_classes() {
        assert_eq!(classify_status("Timed_Out"), MemoryKind::Blocker);
        assert_eq!(classify_status("cancelled"), MemoryKind::Blocker);
        assert_eq!(classify_status("ok"), MemoryKind::Fact);
        assert_eq!(classify_status("running"), MemoryKind::Artifact);
        assert!(is_completion("task_complete"));
        assert!(!is_completion("paused"));
    }

    #[test]
    fn failure_becomes_blocker() {
        let plan = plan_extraction(&evidence(vec![span(
            "s1",
            "apply_patch",
            "error",
            Some(json!({"error": {"code": "execution_error", "message": "hunk failed"}})),
        )]));
        assert_eq!(plan.upserts.len(), 1);
        let blocker = &plan.upserts[0];
        assert_eq!(blocker.kind, MemoryKind::Blocker);
        assert_eq!(blocker.memory_id, blocker_id(&key(), "apply_patch"));
        assert!(blocker.content.starts_with("Tool blocked: apply_patch"));
        assert!(blocker.content.contains("hunk failed"));
    }

    #[test]
    fn later_success_clears_blocker() {
        let plan = plan_extraction(&evidence(vec![
            span("s1", "apply_patch", "error", None),
            span("s2", "apply_patch", "success", Some(json!({"summary": "patched"}))),
        ]));
        let id = blocker_id(&key(), "apply_patch");
        assert!(plan.deletes.contains(&id));
        assert!(plan.upserts.iter().all(|m| m.kind != MemoryKind::Blocker));
        assert!(plan.upserts.iter().any(|m| m.kind == MemoryKind::Fact));
    }

    #[test]
    fn ids_are_stable() {
        let mut ev = evidence(vec![span("s1", "grep", "success", None)]);
        ev.final_summary = Some("Done refactoring".into());
        ev.finalization = Some("done".into());
        ev.objective = Some("Refactor parser".into());

        let a = plan_extraction(&ev);
        let b = plan_extraction(&ev);
        let ids = |p: &ExtractionPlan| p.upserts.iter().map(|m| m.memory_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));

        let decision = a.upserts.iter().find(|m| m.kind == MemoryKind::Decision).unwrap();
        assert_eq!(decision.scope, MemoryScope::LongTerm);
        let objective = a.upserts.iter().find(|m| m.kind == MemoryKind::Constraint).unwrap();
        assert_eq!(objective.scope, MemoryScope::Working);
    }

    #[test]
    fn spans_of_other_runs_are_ignored() {
        let mut other = span("s9", "apply_patch", "error", None);
        other.run_id = Some("run-2".into());
        assert!(plan_extraction(&evidence(vec![other])).is_empty());
    }
}
