//! End-to-end executor tests: full runs against an in-memory store with the
//! echo capability, covering condition routing, loop partitioning and
//! fail-soft node errors.

use std::sync::Arc;

use larkspur_capability::{CapabilityRegistry, EchoCapability, FailingCapability};
use larkspur_config::{Release, WorkflowDef};
use larkspur_engine::RunExecutor;
use larkspur_store::{NewRun, Run, RunStatus, SqliteStore, Store, TaskStatus};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

fn registry() -> Arc<CapabilityRegistry> {
  let mut registry = CapabilityRegistry::new();
  registry.register("echo", Arc::new(EchoCapability));
  registry.register("boom", Arc::new(FailingCapability { message: "quota exceeded".into() }));
  Arc::new(registry)
}

async fn enqueue(store: &SqliteStore, def: Value, input: Value) -> Run {
  let def: WorkflowDef = serde_json::from_value(def).unwrap();
  let release = Release::from_def("wf", 1, &def).unwrap();
  store.create_release(&release).await.unwrap();
  store
    .create_run(&NewRun {
      workflow_id: "wf".to_string(),
      release_id: release.id,
      input: Some(input),
      created_by: None,
    })
    .await
    .unwrap()
}

async fn run_to_completion(store: &SqliteStore, def: Value, input: Value) -> (Run, RunStatus) {
  enqueue(store, def, input).await;
  let claimed = store.claim_next_run().await.unwrap().unwrap();
  let executor = RunExecutor::new(store.clone(), registry());
  let status = executor.execute(&claimed, &CancellationToken::new()).await.unwrap();
  let reloaded = store.get_run(&claimed.id).await.unwrap();
  (reloaded, status)
}

fn events(logs: &[larkspur_store::RunLog]) -> Vec<&str> {
  logs.iter().map(|l| l.event.as_str()).collect()
}

#[tokio::test]
async fn test_linear_run_succeeds_with_logs() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let def = json!({
    "nodes": [
      { "id": "s", "type": "start" },
      { "id": "t", "type": "tool",
        "data": { "capability": "echo", "params": { "question": "{{s.input}}" } } },
      { "id": "e", "type": "end" }
    ],
    "edges": [
      { "id": "e1", "source": "s", "target": "t" },
      { "id": "e2", "source": "t", "target": "e" }
    ]
  });

  let (run, status) = run_to_completion(&store, def, json!({ "q": "hello" })).await;
  assert_eq!(status, RunStatus::Success);
  assert_eq!(run.status, RunStatus::Success);

  // The sole-field input unwraps, so the tool sees the raw question.
  let output = run.output.unwrap().0;
  assert_eq!(output["t"]["question"], json!("hello"));
  assert!(run.finished_at.is_some());

  let logs = store.get_logs(&run.id, 0, 100).await.unwrap();
  let events = events(&logs);
  assert_eq!(events.first(), Some(&"workflow_start"));
  assert_eq!(events.last(), Some(&"workflow_end"));
  assert!(events.contains(&"node_start"));
  assert!(events.contains(&"node_end"));
}

#[tokio::test]
async fn test_condition_routes_true_branch() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let def = json!({
    "nodes": [
      { "id": "s", "type": "start" },
      { "id": "c", "type": "condition",
        "data": { "condition": { "left": "{{s.input}}", "comparator": ">", "right": 3 } } },
      { "id": "a", "type": "tool", "data": { "capability": "echo", "params": { "hit": true } } },
      { "id": "e", "type": "end" }
    ],
    "edges": [
      { "id": "e1", "source": "s", "target": "c" },
      { "id": "e2", "source": "c", "target": "a", "condition": "true" },
      { "id": "e3", "source": "c", "target": "e", "condition": "false" },
      { "id": "e4", "source": "a", "target": "e" }
    ]
  });

  let (run, status) = run_to_completion(&store, def, json!({ "x": 5 })).await;
  assert_eq!(status, RunStatus::Success);
  let output = run.output.unwrap().0;
  assert_eq!(output["a"]["hit"], json!(true));

  let tasks = store.list_node_tasks(&run.id).await.unwrap();
  let a = tasks.iter().find(|t| t.node_id == "a").unwrap();
  assert_eq!(a.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_condition_false_branch_skips_other_side() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let def = json!({
    "nodes": [
      { "id": "s", "type": "start" },
      { "id": "c", "type": "condition",
        "data": { "condition": { "left": "{{s.input}}", "comparator": ">", "right": 3 } } },
      { "id": "a", "type": "tool", "data": { "capability": "echo", "params": { "hit": true } } },
      { "id": "e", "type": "end" }
    ],
    "edges": [
      { "id": "e1", "source": "s", "target": "c" },
      { "id": "e2", "source": "c", "target": "a", "condition": "true" },
      { "id": "e3", "source": "c", "target": "e", "condition": "false" },
      { "id": "e4", "source": "a", "target": "e" }
    ]
  });

  let (run, status) = run_to_completion(&store, def, json!({ "x": 1 })).await;
  assert_eq!(status, RunStatus::Success);

  let tasks = store.list_node_tasks(&run.id).await.unwrap();
  let a = tasks.iter().find(|t| t.node_id == "a").unwrap();
  assert_eq!(a.status, TaskStatus::Skipped);

  // The end node still executes and collects the condition's output.
  let output = run.output.unwrap().0;
  assert_eq!(output["c"], json!({ "result": false }));
  assert!(output.get("a").is_none());
}

#[tokio::test]
async fn test_failed_node_does_not_abort_run() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let def = json!({
    "nodes": [
      { "id": "s", "type": "start" },
      { "id": "t", "type": "tool", "data": { "capability": "boom" } },
      { "id": "e", "type": "end" }
    ],
    "edges": [
      { "id": "e1", "source": "s", "target": "t" },
      { "id": "e2", "source": "t", "target": "e" }
    ]
  });

  let (run, status) = run_to_completion(&store, def, json!({})).await;
  // The node fails; the run itself still completes.
  assert_eq!(status, RunStatus::Success);

  let tasks = store.list_node_tasks(&run.id).await.unwrap();
  let t = tasks.iter().find(|t| t.node_id == "t").unwrap();
  assert_eq!(t.status, TaskStatus::Failed);

  let output = run.output.unwrap().0;
  assert!(output["t"]["error"].as_str().unwrap().contains("quota exceeded"));
}

fn scored_loop_def(max_iterations: u32, threshold: i64) -> Value {
  json!({
    "nodes": [
      { "id": "s", "type": "start" },
      { "id": "gen", "type": "tool",
        "data": { "capability": "echo",
                  "params": { "output": [{ "score": 9 }, { "score": 5 }, { "score": 7 }] } } },
      { "id": "refine", "type": "loop",
        "data": { "settings": {
          "max_iterations": max_iterations,
          "break_conditions": [
            { "field": "Scorer.output.score", "comparator": ">=", "value": threshold }
          ]
        } } },
      { "id": "score", "label": "Scorer", "type": "tool",
        "data": { "capability": "echo", "params": { "output": "{{loop.items}}" } },
        "loop_id": "refine" },
      { "id": "e", "type": "end" }
    ],
    "edges": [
      { "id": "e1", "source": "s", "target": "gen" },
      { "id": "e2", "source": "gen", "target": "score" },
      { "id": "e3", "source": "score", "target": "e" }
    ]
  })
}

#[tokio::test]
async fn test_loop_partitions_passed_and_pending() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let (run, status) = run_to_completion(&store, scored_loop_def(3, 8), json!({})).await;
  assert_eq!(status, RunStatus::Success);

  let output = run.output.unwrap().0;
  let loop_output = &output["refine"];
  // Only the 9 passes; 5 and 7 stay pending through the cap.
  assert_eq!(loop_output["output"], json!([{ "score": 9 }]));
  assert_eq!(loop_output["pending_items"], json!([{ "score": 5 }, { "score": 7 }]));
  assert_eq!(loop_output["iterations"], json!(3));

  // Iteration 2 was seeded with exactly the pending items from iteration 1.
  let tasks = store.list_node_tasks(&run.id).await.unwrap();
  let second = tasks
    .iter()
    .find(|t| t.node_id == "score" && t.iteration == Some(2))
    .expect("second iteration task");
  assert_eq!(
    second.input.as_ref().unwrap().0["output"],
    json!([{ "score": 5 }, { "score": 7 }])
  );
  assert_eq!(second.loop_node_id.as_deref(), Some("refine"));
}

#[tokio::test]
async fn test_loop_cap_with_nothing_passing() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let (run, status) = run_to_completion(&store, scored_loop_def(2, 100), json!({})).await;
  assert_eq!(status, RunStatus::Success);

  let loop_output = &run.output.unwrap().0["refine"];
  assert_eq!(loop_output["iterations"], json!(2));
  assert_eq!(loop_output["output"], json!([]));
  // Nothing ever passed: the leftover equals the initial seed.
  assert_eq!(loop_output["pending_items"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_loop_breaks_when_all_items_pass() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let (run, status) = run_to_completion(&store, scored_loop_def(10, 5), json!({})).await;
  assert_eq!(status, RunStatus::Success);

  let loop_output = &run.output.unwrap().0["refine"];
  // All scores pass on the first pass, so the loop stops after one
  // iteration, well before the cap.
  assert_eq!(loop_output["iterations"], json!(1));
  assert_eq!(loop_output["output"].as_array().unwrap().len(), 3);
  assert_eq!(loop_output["pending_items"], json!([]));
}

#[tokio::test]
async fn test_cancelled_run_stops_at_batch_boundary() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let def = json!({
    "nodes": [
      { "id": "s", "type": "start" },
      { "id": "e", "type": "end" }
    ],
    "edges": [{ "id": "e1", "source": "s", "target": "e" }]
  });
  enqueue(&store, def, json!({})).await;
  let claimed = store.claim_next_run().await.unwrap().unwrap();
  assert!(store.cancel_run(&claimed.id).await.unwrap());

  let executor = RunExecutor::new(store.clone(), registry());
  let status = executor.execute(&claimed, &CancellationToken::new()).await.unwrap();
  assert_eq!(status, RunStatus::Canceled);

  let run = store.get_run(&claimed.id).await.unwrap();
  assert_eq!(run.status, RunStatus::Canceled);
  let logs = store.get_logs(&run.id, 0, 100).await.unwrap();
  assert!(events(&logs).contains(&"workflow_cancelled"));
}

#[tokio::test]
async fn test_compile_failure_fails_run() {
  let store = SqliteStore::connect_in_memory().await.unwrap();
  let def = json!({
    "nodes": [
      { "id": "s", "type": "start" },
      { "id": "t", "type": "tool", "data": { "capability": "no-such-capability" } },
      { "id": "e", "type": "end" }
    ],
    "edges": [
      { "id": "e1", "source": "s", "target": "t" },
      { "id": "e2", "source": "t", "target": "e" }
    ]
  });

  let (run, status) = run_to_completion(&store, def, json!({})).await;
  assert_eq!(status, RunStatus::Failed);
  assert_eq!(run.status, RunStatus::Failed);
  let error = run.error.unwrap().0;
  assert!(error["error"].as_str().unwrap().contains("no-such-capability"));

  let logs = store.get_logs(&run.id, 0, 100).await.unwrap();
  assert_eq!(events(&logs).last(), Some(&"workflow_error"));
}
