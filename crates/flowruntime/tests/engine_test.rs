// crates/flowruntime/tests/engine_test.rs

mod common;

use common::{init_tracing, registry, BrokenStore, GaugeNode, RecordingHooks};
use flowcore::{
    ErrorKind, ExecutionEvent, ExecutionStatus, FailurePolicy, FlowError, NodeSpec, NodeStatus,
    ValidationIssue, Workflow,
};
use flowruntime::{CheckpointStore, ExecutionOptions, FlowRuntime, RuntimeConfig};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> FlowRuntime {
    FlowRuntime::in_memory(Arc::new(registry()))
}

#[tokio::test]
async fn test_upstream_output_feeds_expression() {
    init_tracing();
    let mut wf = Workflow::new("scenario a");
    wf.add_node(NodeSpec::new("A", "test.echo").with_config("y", 5));
    wf.add_node(
        NodeSpec::new("B", "test.echo").with_config_value(json!("{{ $node[\"A\"].y * 2 }}")),
    );
    wf.add_node(NodeSpec::new("C", "test.echo").with_config("from_b", "{{ $json }}"));
    wf.connect("A", "B");
    wf.connect("B", "C");

    let execution = runtime()
        .execute(&wf, json!({"x": 1}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.latest("B").unwrap().input, Some(json!(10)));
    assert_eq!(execution.output("C"), Some(&json!({"from_b": 10})));
    assert!(execution.error.is_none());
    assert!(execution.finished_at.is_some());
}

#[tokio::test]
async fn test_root_sees_trigger_payload() {
    let mut wf = Workflow::new("trigger");
    wf.add_node(NodeSpec::new("a", "test.echo").with_config("doubled", "{{ $json.x * 2 }}"));

    let execution = runtime()
        .execute(&wf, json!({"x": 21}), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(execution.output("a"), Some(&json!({"doubled": 42})));
}

#[tokio::test]
async fn test_error_edge_completes_execution() {
    init_tracing();
    let mut wf = Workflow::new("scenario b");
    wf.add_node(NodeSpec::new("A", "test.fail"));
    wf.add_node(NodeSpec::new("B", "test.echo"));
    wf.add_node(NodeSpec::new("C", "test.echo"));
    wf.add_node(NodeSpec::new("E", "test.echo").with_config("reason", "{{ $json.error.message }}"));
    wf.connect("A", "B");
    wf.connect("B", "C");
    wf.connect_error("A", "E");

    let execution = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.error.is_none());
    assert_eq!(execution.latest("A").unwrap().status, NodeStatus::Failed);
    assert_eq!(execution.latest("E").unwrap().status, NodeStatus::Success);
    assert_eq!(execution.latest("B").unwrap().status, NodeStatus::Skipped);
    assert_eq!(execution.latest("C").unwrap().status, NodeStatus::Skipped);

    let reason = execution.output("E").unwrap()["reason"].as_str().unwrap();
    assert!(reason.contains("boom"), "{reason}");
}

#[tokio::test]
async fn test_retry_records_every_attempt() {
    let mut wf = Workflow::new("retry");
    wf.add_node(NodeSpec::new("a", "test.fail").with_retry(3, 1));

    let hooks = Arc::new(RecordingHooks::default());
    let execution = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default().with_hooks(hooks.clone()))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let attempts = execution.attempts("a");
    assert_eq!(attempts.len(), 3);
    assert_eq!(
        attempts.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(attempts.iter().all(|r| r.status == NodeStatus::Failed));

    let error = execution.error.unwrap();
    assert_eq!(error.kind, ErrorKind::NodeHandler);
    assert_eq!(error.node_id.as_deref(), Some("a"));

    assert_eq!(
        hooks.calls(),
        vec![
            "start:a:1",
            "error:a:1:retry",
            "start:a:2",
            "error:a:2:retry",
            "start:a:3",
            "error:a:3:final",
        ]
    );
}

#[tokio::test]
async fn test_flaky_node_recovers_on_retry() {
    let mut wf = Workflow::new("flaky");
    wf.add_node(
        NodeSpec::new("a", "test.flaky")
            .with_config("succeed_on", 2)
            .with_retry(3, 1),
    );
    wf.add_node(NodeSpec::new("b", "test.echo").with_config_value(json!("{{ $json }}")));
    wf.connect("a", "b");

    let execution = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let statuses: Vec<_> = execution.attempts("a").iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![NodeStatus::Failed, NodeStatus::Success]);
    assert_eq!(execution.output("b"), Some(&json!({"attempt": 2})));
}

#[tokio::test]
async fn test_error_edge_waits_for_retries() {
    let mut wf = Workflow::new("retry then route");
    wf.add_node(NodeSpec::new("call", "test.fail").with_retry(2, 1));
    wf.add_node(NodeSpec::new("fallback", "test.echo").with_config("attempt", "{{ $json.error.attempt }}"));
    wf.connect_error("call", "fallback");

    let execution = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.attempts("call").len(), 2);
    assert_eq!(execution.output("fallback"), Some(&json!({"attempt": 2})));
}

fn failing_sibling(policy: FailurePolicy) -> Workflow {
    let mut wf = Workflow::new("siblings");
    wf.settings.on_error = policy;
    wf.add_node(NodeSpec::new("bad", "test.fail"));
    wf.add_node(NodeSpec::new("slow", "test.sleep").with_config("ms", 100));
    wf.add_node(NodeSpec::new("after_slow", "test.echo"));
    wf.add_node(NodeSpec::new("after_bad", "test.echo"));
    wf.connect("slow", "after_slow");
    wf.connect("bad", "after_bad");
    wf
}

#[tokio::test]
async fn test_fail_fast_lets_running_siblings_finish() {
    let execution = runtime()
        .execute(
            &failing_sibling(FailurePolicy::FailFast),
            json!({}),
            ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.latest("slow").unwrap().status, NodeStatus::Success);
    assert!(execution.latest("after_slow").is_none());
    assert!(execution.latest("after_bad").is_none());
    assert_eq!(execution.error.unwrap().node_id.as_deref(), Some("bad"));
}

#[tokio::test]
async fn test_best_effort_runs_independent_branches() {
    let execution = runtime()
        .execute(
            &failing_sibling(FailurePolicy::BestEffort),
            json!({}),
            ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.latest("after_slow").unwrap().status, NodeStatus::Success);
    assert_eq!(execution.latest("after_bad").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn test_conditional_edges_follow_declared_branch() {
    let mut wf = Workflow::new("branch");
    wf.add_node(NodeSpec::new("check", "test.branch").with_config("value", "{{ $json.n > 3 }}"));
    wf.add_node(NodeSpec::new("big", "test.echo"));
    wf.add_node(NodeSpec::new("small", "test.echo"));
    wf.add_node(NodeSpec::new("join", "test.echo"));
    wf.connect_branch("check", "big", true);
    wf.connect_branch("check", "small", false);
    wf.connect("big", "join");

    let rt = runtime();
    let execution = rt
        .execute(&wf, json!({"n": 5}), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(execution.latest("check").unwrap().branch, Some(true));
    assert_eq!(execution.latest("big").unwrap().status, NodeStatus::Success);
    assert_eq!(execution.latest("small").unwrap().status, NodeStatus::Skipped);
    assert_eq!(execution.latest("join").unwrap().status, NodeStatus::Success);

    let execution = rt
        .execute(&wf, json!({"n": 1}), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.latest("big").unwrap().status, NodeStatus::Skipped);
    assert_eq!(execution.latest("join").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn test_expression_failure_follows_retry_policy() {
    let mut wf = Workflow::new("bad expression");
    wf.add_node(
        NodeSpec::new("a", "test.echo")
            .with_config("v", "{{ upper(42) }}")
            .with_retry(2, 1),
    );

    let execution = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let attempts = execution.attempts("a");
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|r| r.input.is_none()));
    assert_eq!(
        attempts[1].error.as_ref().unwrap().kind,
        ErrorKind::ExpressionRuntime
    );
}

#[tokio::test]
async fn test_invalid_workflow_is_rejected() {
    let mut wf = Workflow::new("cycle");
    wf.add_node(NodeSpec::new("a", "test.echo"));
    wf.add_node(NodeSpec::new("b", "test.echo"));
    wf.connect("a", "b");
    wf.connect("b", "a");

    let err = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default())
        .await
        .unwrap_err();
    match err {
        FlowError::Validation(errors) => {
            assert!(errors.contains(|i| matches!(i, ValidationIssue::Cycle { .. })))
        }
        other => panic!("expected validation error, got {other}"),
    }

    let mut wf = Workflow::new("forbidden");
    wf.add_node(NodeSpec::new("a", "test.echo").with_config("v", "{{ eval(\"1+1\") }}"));
    let err = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));
}

#[tokio::test]
async fn test_cancel_stops_execution() {
    let mut wf = Workflow::new("cancel");
    wf.add_node(NodeSpec::new("slow", "test.sleep").with_config("ms", 10_000));
    wf.add_node(NodeSpec::new("next", "test.echo"));
    wf.connect("slow", "next");

    let rt = runtime();
    let handle = rt.start(&wf, json!({}), ExecutionOptions::default()).unwrap();
    let id = handle.execution_id();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rt.cancel(id));

    let execution = handle.wait().await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    let slow = execution.latest("slow").unwrap();
    assert_eq!(slow.status, NodeStatus::Failed);
    assert_eq!(slow.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert!(execution.latest("next").is_none());
    assert!(!rt.cancel(id));
}

#[tokio::test]
async fn test_node_timeout_is_retried() {
    let mut wf = Workflow::new("timeout");
    wf.add_node(
        NodeSpec::new("slow", "test.sleep")
            .with_config("ms", 5_000)
            .with_timeout_ms(20)
            .with_retry(2, 1),
    );

    let execution = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let attempts = execution.attempts("slow");
    assert_eq!(attempts.len(), 2);
    assert!(attempts
        .iter()
        .all(|r| r.error.as_ref().unwrap().kind == ErrorKind::Timeout));
}

#[tokio::test]
async fn test_execution_time_limit() {
    let mut wf = Workflow::new("deadline");
    wf.settings.max_execution_time_ms = Some(50);
    wf.add_node(NodeSpec::new("slow", "test.sleep").with_config("ms", 5_000));

    let execution = runtime()
        .execute(&wf, json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let gauge = Arc::new(GaugeNode::default());
    let mut registry = registry();
    registry.register(gauge.clone());
    let rt = FlowRuntime::in_memory(Arc::new(registry));

    let mut wf = Workflow::new("fan out");
    wf.add_node(NodeSpec::new("start", "test.echo"));
    for i in 0..6 {
        wf.add_node(NodeSpec::new(format!("n{i}"), "test.gauge"));
        wf.connect("start", format!("n{i}"));
    }

    let execution = rt
        .execute(&wf, json!({}), ExecutionOptions::default().with_max_parallel(2))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.results.len(), 7);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_env_comes_from_options() {
    let mut wf = Workflow::new("env");
    wf.add_node(NodeSpec::new("a", "test.echo").with_config("region", "{{ $env.REGION }}"));

    let execution = runtime()
        .execute(
            &wf,
            json!({}),
            ExecutionOptions::default().with_env("REGION", "eu-west-1"),
        )
        .await
        .unwrap();
    assert_eq!(execution.output("a"), Some(&json!({"region": "eu-west-1"})));
}

#[tokio::test]
async fn test_events_bracket_the_execution() {
    let rt = runtime();
    let mut events = rt.subscribe_events();

    let mut wf = Workflow::new("events");
    wf.add_node(NodeSpec::new("a", "test.echo"));
    let execution = rt
        .execute(&wf, json!({}), ExecutionOptions::default().without_checkpointing())
        .await
        .unwrap();
    assert!(execution.checkpoint.is_none());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(
        seen.first(),
        Some(ExecutionEvent::ExecutionStarted { resumed: false, .. })
    ));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ExecutionEvent::NodeCompleted { node_id, .. } if node_id == "a")));
    assert!(matches!(
        seen.last(),
        Some(ExecutionEvent::ExecutionFinished {
            status: ExecutionStatus::Completed,
            ..
        })
    ));
    assert!(seen.iter().all(|e| e.execution_id() == execution.id));
}

fn chain() -> Workflow {
    let mut wf = Workflow::new("chain");
    wf.add_node(NodeSpec::new("a", "test.echo"));
    wf.add_node(NodeSpec::new("b", "test.echo"));
    wf.add_node(NodeSpec::new("c", "test.echo"));
    wf.connect("a", "b");
    wf.connect("b", "c");
    wf
}

#[tokio::test]
async fn test_checkpoint_failure_fails_execution() {
    init_tracing();
    let store = Arc::new(BrokenStore::failing_from(1));
    let rt = FlowRuntime::new(Arc::new(registry()), store.clone(), RuntimeConfig::default());

    let execution = rt
        .execute(&chain(), json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_ref().unwrap().kind, ErrorKind::Checkpoint);
    assert!(execution.checkpoint.is_none());
    assert_eq!(execution.latest("c").unwrap().status, NodeStatus::Success);
    assert!(store.load_latest(execution.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_checkpoint_failure_reports_last_durable_sequence() {
    let store = Arc::new(BrokenStore::failing_from(3));
    let rt = FlowRuntime::new(Arc::new(registry()), store.clone(), RuntimeConfig::default());

    let execution = rt
        .execute(&chain(), json!({}), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_ref().unwrap().kind, ErrorKind::Checkpoint);
    assert_eq!(execution.checkpoint, Some(2));
    let durable = store.load_latest(execution.id).await.unwrap().unwrap();
    assert_eq!(durable.sequence, 2);
    assert!(!durable.status.is_terminal());
}
