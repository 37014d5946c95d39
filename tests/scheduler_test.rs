// Tests for batch dispatch of tool calls

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use runledger::tools::{
    DispatchContext, HandlerError, PartialToolCall, ToolCall, ToolDef, ToolErrorInfo, ToolHandler,
    ToolInterceptor, ToolOutput, ToolRegistry, ToolResult, ToolScheduler, ToolStatus, MODE_ACT,
    MODE_PLAN,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Echoes its name and tracks how many invocations overlap
#[derive(Default)]
struct Counter {
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    delay_ms: u64,
}

impl Counter {
    fn slow(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            delay_ms,
            ..Self::default()
        })
    }
}

#[async_trait]
impl ToolHandler for Counter {
    async fn execute(&self, _ctx: &DispatchContext, call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolOutput::new(format!("{} done", call.tool_id)).with_details(call.args.clone()))
    }
}

/// Fails the way its args ask it to
struct Failing;

#[async_trait]
impl ToolHandler for Failing {
    async fn execute(&self, _ctx: &DispatchContext, call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        match call.args.get("how").and_then(Value::as_str) {
            Some("cancel") => Err(HandlerError::Canceled),
            Some("deadline") => Err(HandlerError::DeadlineExceeded),
            Some("missing") => Err(HandlerError::Failed(anyhow::Error::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such file",
            )))),
            _ => Err(HandlerError::failed("exploded")),
        }
    }
}

fn object_schema() -> Value {
    json!({"type": "object", "properties": {"path": {"type": "string"}}})
}

fn registry_with(tools: Vec<(ToolDef, Arc<dyn ToolHandler>)>) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::default());
    for (def, handler) in tools {
        registry.register(def, handler).unwrap();
    }
    registry
}

fn reader(name: &str) -> ToolDef {
    ToolDef::new(name, "reads", object_schema()).parallel_safe(true)
}

fn writer(name: &str) -> ToolDef {
    ToolDef::new(name, "writes", object_schema()).mutating(true)
}

fn call(id: &str, name: &str) -> ToolCall {
    ToolCall::new(id, name, json!({}))
}

#[tokio::test]
async fn test_one_result_per_call_in_input_order() {
    let counter = Counter::slow(5);
    let registry = registry_with(vec![
        (reader("read"), counter.clone() as Arc<dyn ToolHandler>),
        (writer("write"), counter.clone() as Arc<dyn ToolHandler>),
    ]);
    let scheduler = ToolScheduler::new(registry);

    let calls = vec![
        call("c1", "write"),
        call("c2", "read"),
        call("c3", "nope"),
        call("c4", "read"),
        call("c5", "write"),
    ];
    let results = scheduler.dispatch(&DispatchContext::new(MODE_ACT), calls).await;

    let ids: Vec<&str> = results.iter().map(|r| r.tool_id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2", "c3", "c4", "c5"]);
    assert_eq!(results[2].status, ToolStatus::Error);
    assert_eq!(results[2].error.as_ref().unwrap().code, "argument_error");
    assert!(results.iter().filter(|r| r.tool_id != "c3").all(ToolResult::is_success));
    assert_eq!(counter.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_empty_batch() {
    let scheduler = ToolScheduler::new(Arc::new(ToolRegistry::default()));
    let results = scheduler.dispatch(&DispatchContext::new(MODE_ACT), Vec::new()).await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_parallel_calls_are_bounded() {
    let counter = Counter::slow(20);
    let registry = registry_with(vec![(reader("read"), counter.clone() as Arc<dyn ToolHandler>)]);
    let scheduler = ToolScheduler::new(registry);

    let calls = (0..6).map(|i| call(&format!("c{}", i), "read")).collect();
    let results = scheduler.dispatch(&DispatchContext::new(MODE_ACT), calls).await;

    assert_eq!(results.len(), 6);
    assert!(results.iter().all(ToolResult::is_success));
    assert_eq!(counter.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_mutating_calls_run_one_at_a_time() {
    let counter = Counter::slow(5);
    // parallel-safe but mutating still counts as serial
    let def = writer("write").parallel_safe(true);
    let registry = registry_with(vec![(def, counter.clone() as Arc<dyn ToolHandler>)]);
    let scheduler = ToolScheduler::new(registry).with_max_parallel(4);

    let calls = (0..4).map(|i| call(&format!("c{}", i), "write")).collect();
    scheduler.dispatch(&DispatchContext::new(MODE_ACT), calls).await;
    assert_eq!(counter.peak.load(Ordering::SeqCst), 1);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_plan_mode_hides_mutating_tools() {
    let counter = Counter::slow(0);
    let registry = registry_with(vec![
        (reader("read"), counter.clone() as Arc<dyn ToolHandler>),
        (writer("write"), counter.clone() as Arc<dyn ToolHandler>),
    ]);
    let scheduler = ToolScheduler::new(registry);

    let active: Vec<String> = scheduler.active_tools(MODE_PLAN).into_iter().map(|d| d.name).collect();
    assert_eq!(active, vec!["read"]);
    assert_eq!(scheduler.active_tools(MODE_ACT).len(), 2);

    let results = scheduler
        .dispatch(&DispatchContext::new(MODE_PLAN), vec![call("c1", "write")])
        .await;
    let error = results[0].error.as_ref().unwrap();
    assert_eq!(error.code, "argument_error");
    assert!(error.message.contains("unknown or disabled tool"));
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_handler() {
    let counter = Counter::slow(0);
    let def = ToolDef::new(
        "read",
        "reads",
        json!({"type": "object", "required": ["path"], "properties": {"path": {"type": "string"}}}),
    );
    let registry = registry_with(vec![(def, counter.clone() as Arc<dyn ToolHandler>)]);
    let scheduler = ToolScheduler::new(registry);

    let calls = vec![
        ToolCall::new("c1", "read", json!({})),
        ToolCall::new("c2", "read", json!({"path": 3})),
        ToolCall::new("c3", "read", json!({"path": "src/lib.rs"})),
    ];
    let results = scheduler.dispatch(&DispatchContext::new(MODE_ACT), calls).await;

    assert_eq!(results[0].error.as_ref().unwrap().code, "argument_error");
    assert_eq!(results[1].error.as_ref().unwrap().code, "argument_error");
    assert!(results[2].is_success());
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_dispatch_aborts_everything() {
    let counter = Counter::slow(0);
    let registry = registry_with(vec![
        (reader("read"), counter.clone() as Arc<dyn ToolHandler>),
        (writer("write"), counter.clone() as Arc<dyn ToolHandler>),
    ]);
    let scheduler = ToolScheduler::new(registry);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let ctx = DispatchContext::new(MODE_ACT).with_cancel(cancel);
    let results = scheduler
        .dispatch(&ctx, vec![call("c1", "read"), call("c2", "write")])
        .await;

    assert!(results.iter().all(|r| r.status == ToolStatus::Aborted));
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_failures_are_classified() {
    let registry = registry_with(vec![(writer("fail"), Arc::new(Failing) as Arc<dyn ToolHandler>)]);
    let scheduler = ToolScheduler::new(registry);

    let calls = vec![
        ToolCall::new("c1", "fail", json!({"how": "cancel"})),
        ToolCall::new("c2", "fail", json!({"how": "deadline"})),
        ToolCall::new("c3", "fail", json!({"how": "missing"})),
        ToolCall::new("c4", "fail", json!({})),
    ];
    let results = scheduler.dispatch(&DispatchContext::new(MODE_ACT), calls).await;

    assert_eq!(results[0].status, ToolStatus::Aborted);
    assert_eq!(results[1].status, ToolStatus::Timeout);
    assert_eq!(results[2].status, ToolStatus::Error);
    assert_eq!(results[2].error.as_ref().unwrap().code, "not_found");
    assert_eq!(results[3].error.as_ref().unwrap().code, "execution_error");
}

/// Rewrites arguments, vetoes one tool and stamps successful results
#[derive(Default)]
struct Guard {
    finished: AtomicUsize,
}

#[async_trait]
impl ToolInterceptor for Guard {
    async fn before_exec(&self, _ctx: &DispatchContext, call: &mut ToolCall) -> Result<(), ToolErrorInfo> {
        if call.tool_name == "write" {
            return Err(ToolErrorInfo::new("policy_denied", "writes are blocked"));
        }
        call.args = json!({"path": "rewritten"});
        Ok(())
    }

    async fn after_exec(
        &self,
        _ctx: &DispatchContext,
        _call: &ToolCall,
        result: &mut ToolResult,
    ) -> Result<(), ToolErrorInfo> {
        result.summary = format!("{} (checked)", result.summary);
        Ok(())
    }

    async fn finished(&self, _ctx: &DispatchContext, _call: &ToolCall, _result: &ToolResult) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_interceptors_wrap_execution() {
    let counter = Counter::slow(0);
    let registry = registry_with(vec![
        (reader("read"), counter.clone() as Arc<dyn ToolHandler>),
        (writer("write"), counter.clone() as Arc<dyn ToolHandler>),
    ]);
    let guard = Arc::new(Guard::default());
    let scheduler = ToolScheduler::new(registry).with_interceptor(guard.clone());

    let results = scheduler
        .dispatch(
            &DispatchContext::new(MODE_ACT),
            vec![call("c1", "read"), call("c2", "write"), call("c3", "missing")],
        )
        .await;

    assert!(results[0].is_success());
    assert_eq!(results[0].summary, "c1 done (checked)");
    assert_eq!(results[0].details, Some(json!({"path": "rewritten"})));

    assert_eq!(results[1].status, ToolStatus::Error);
    assert_eq!(results[1].error.as_ref().unwrap().code, "policy_denied");

    // the unknown tool never reached execution
    assert_eq!(guard.finished.load(Ordering::SeqCst), 2);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

/// Rejects every successful result after execution
struct RejectAll;

#[async_trait]
impl ToolInterceptor for RejectAll {
    async fn after_exec(
        &self,
        _ctx: &DispatchContext,
        _call: &ToolCall,
        _result: &mut ToolResult,
    ) -> Result<(), ToolErrorInfo> {
        Err(ToolErrorInfo::new("review_failed", "output rejected"))
    }
}

#[tokio::test]
async fn test_after_exec_error_replaces_result() {
    let counter = Counter::slow(0);
    let registry = registry_with(vec![(reader("read"), counter.clone() as Arc<dyn ToolHandler>)]);
    let scheduler = ToolScheduler::new(registry).with_interceptor(Arc::new(RejectAll));

    let results = scheduler
        .dispatch(&DispatchContext::new(MODE_ACT), vec![call("c1", "read")])
        .await;

    assert_eq!(results[0].status, ToolStatus::Error);
    assert_eq!(results[0].error.as_ref().unwrap().code, "review_failed");
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

/// Cancels the shared token from inside the first call it runs
struct Canceller {
    cancel: CancellationToken,
    calls: AtomicUsize,
}

#[async_trait]
impl ToolHandler for Canceller {
    async fn execute(&self, _ctx: &DispatchContext, _call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(ToolOutput::new("finished anyway"))
    }
}

#[tokio::test]
async fn test_cancel_while_waiting_for_a_slot() {
    let cancel = CancellationToken::new();
    let handler = Arc::new(Canceller {
        cancel: cancel.clone(),
        calls: AtomicUsize::new(0),
    });
    let registry = registry_with(vec![(reader("read"), handler.clone() as Arc<dyn ToolHandler>)]);
    let scheduler = ToolScheduler::new(registry).with_max_parallel(1);

    let ctx = DispatchContext::new(MODE_ACT).with_cancel(cancel);
    let calls = (0..3).map(|i| call(&format!("c{}", i), "read")).collect();
    let results = scheduler.dispatch(&ctx, calls).await;

    assert!(results[0].is_success());
    assert_eq!(results[1].status, ToolStatus::Aborted);
    assert_eq!(results[2].status, ToolStatus::Aborted);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

/// Logs when each call starts and ends
#[derive(Default)]
struct Timeline {
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl ToolHandler for Timeline {
    async fn execute(&self, _ctx: &DispatchContext, call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        self.log.lock().unwrap().push(format!("start {}", call.tool_id));
        if call.tool_name == "read" {
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        self.log.lock().unwrap().push(format!("end {}", call.tool_id));
        Ok(ToolOutput::new("ok"))
    }
}

#[tokio::test]
async fn test_serial_group_waits_for_parallel_group() {
    let timeline = Arc::new(Timeline::default());
    let registry = registry_with(vec![
        (reader("read"), timeline.clone() as Arc<dyn ToolHandler>),
        (writer("write"), timeline.clone() as Arc<dyn ToolHandler>),
    ]);
    let scheduler = ToolScheduler::new(registry);

    let calls = vec![
        call("w1", "write"),
        call("r1", "read"),
        call("w2", "write"),
        call("r2", "read"),
    ];
    scheduler.dispatch(&DispatchContext::new(MODE_ACT), calls).await;

    let log = timeline.log.lock().unwrap().clone();
    let at = |entry: &str| log.iter().position(|e| e == entry).unwrap();
    let last_read_end = at("end r1").max(at("end r2"));
    assert!(at("start w1") > last_read_end);
    assert!(at("start w2") > at("end w1"));
}

/// Panics on every call
struct Exploding;

#[async_trait]
impl ToolHandler for Exploding {
    async fn execute(&self, _ctx: &DispatchContext, _call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        panic!("index out of bounds");
    }
}

#[tokio::test]
async fn test_panicking_handler_fails_only_its_call() {
    let counter = Counter::slow(0);
    let registry = registry_with(vec![
        (reader("boom"), Arc::new(Exploding) as Arc<dyn ToolHandler>),
        (reader("read"), counter.clone() as Arc<dyn ToolHandler>),
    ]);
    let scheduler = ToolScheduler::new(registry);

    let results = scheduler
        .dispatch(
            &DispatchContext::new(MODE_ACT),
            vec![call("c1", "boom"), call("c2", "read")],
        )
        .await;

    assert_eq!(results[0].status, ToolStatus::Error);
    let error = results[0].error.as_ref().unwrap();
    assert_eq!(error.code, "execution_error");
    assert!(error.message.contains("index out of bounds"));
    assert!(results[1].is_success());
}

/// Collects streamed argument fragments
#[derive(Default)]
struct Streaming {
    fragments: Mutex<Vec<String>>,
}

#[async_trait]
impl ToolHandler for Streaming {
    async fn execute(&self, _ctx: &DispatchContext, _call: &ToolCall) -> Result<ToolOutput, HandlerError> {
        Ok(ToolOutput::new("done"))
    }

    async fn handle_partial(&self, _ctx: &DispatchContext, partial: &PartialToolCall) -> Result<(), HandlerError> {
        self.fragments.lock().unwrap().push(partial.args_delta.clone());
        Ok(())
    }
}

fn partial(name: &str, delta: &str) -> PartialToolCall {
    PartialToolCall {
        tool_id: "c1".into(),
        tool_name: name.into(),
        args_delta: delta.into(),
    }
}

#[tokio::test]
async fn test_handle_partial_routes_fragments() {
    let streaming = Arc::new(Streaming::default());
    let strict = ToolDef::new(
        "edit",
        "edits",
        json!({"type": "object", "required": ["path"], "properties": {"path": {"type": "string"}}}),
    )
    .mutating(true);
    let registry = registry_with(vec![
        (strict, streaming.clone() as Arc<dyn ToolHandler>),
        (reader("read"), streaming.clone() as Arc<dyn ToolHandler>),
    ]);
    let scheduler = ToolScheduler::new(registry);
    let act = DispatchContext::new(MODE_ACT);

    // fragments skip argument validation
    scheduler.handle_partial(&act, &partial("edit", "{\"pa")).await.unwrap();
    scheduler.handle_partial(&act, &partial("read", "{}")).await.unwrap();

    let plan = DispatchContext::new(MODE_PLAN);
    let err = scheduler.handle_partial(&plan, &partial("edit", "th\"")).await.unwrap_err();
    assert_eq!(err.code, "argument_error");
    let err = scheduler.handle_partial(&act, &partial("nope", "{}")).await.unwrap_err();
    assert_eq!(err.code, "argument_error");

    assert_eq!(*streaming.fragments.lock().unwrap(), vec!["{\"pa", "{}"]);
}
