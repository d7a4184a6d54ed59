use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use helmsman::error::{EngineError, ErrorKind};
use helmsman::runtime::task::{TaskBuilder, TaskStatus};
use helmsman::{EngineConfig, ManagementContext};
use serde_json::{Value, json};

fn sleeper(name: &str, millis: u64, value: Value) -> TaskBuilder {
    TaskBuilder::new(name).body(move |ctx| async move {
        ctx.sleep(Duration::from_millis(millis)).await?;
        Ok(value)
    })
}

#[tokio::test]
async fn test_single_task_success() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");

    let handle = mgmt
        .tasks()
        .submit_new(TaskBuilder::new("answer").tag("demo").body(|_| async { Ok(json!(42)) }))
        .await
        .expect("submit");

    assert_eq!(handle.get().await.expect("result"), json!(42));
    let record = handle.record().expect("record");
    assert_eq!(record.status, TaskStatus::Success);
    assert!(record.tags.contains("demo"));
    assert!(record.submitted_at.is_some());
    assert!(record.started_at.is_some());
    assert!(record.ended_at >= record.started_at);
}

#[tokio::test]
async fn test_resubmit_is_illegal_state() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let handle = mgmt
        .tasks()
        .submit_new(TaskBuilder::new("once").body(|_| async { Ok(Value::Null) }))
        .await
        .expect("submit");
    handle.get().await.expect("first run");

    let err = handle.submit().await.expect_err("second submit must fail");
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[tokio::test]
async fn test_sequential_children_run_in_order() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");

    // 1. Three children, the first one slowest
    let parent = TaskBuilder::new("seq").sequential(vec![
        sleeper("c1", 40, json!(1)),
        sleeper("c2", 10, json!(2)),
        sleeper("c3", 20, json!(3)),
    ]);
    let handle = mgmt.tasks().submit_new(parent).await.expect("submit");

    // 2. Results follow child order
    assert_eq!(handle.get().await.expect("result"), json!([1, 2, 3]));

    // 3. Each child starts only after its predecessor ended
    let record = handle.record().expect("record");
    let children: Vec<_> = record
        .children
        .iter()
        .map(|id| mgmt.tasks().store().get(*id).expect("child"))
        .collect();
    assert_eq!(children.len(), 3);
    for pair in children.windows(2) {
        assert!(pair[1].started_at.expect("started") >= pair[0].ended_at.expect("ended"));
    }
}

#[tokio::test]
async fn test_sequential_failure_skips_remaining_children() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();

    let parent = TaskBuilder::new("seq").sequential(vec![
        sleeper("ok", 5, json!("a")),
        TaskBuilder::new("boom")
            .body(|_| async { Err(EngineError::Execution("boom".to_string())) }),
        TaskBuilder::new("never").body(move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
    ]);
    let handle = mgmt.tasks().submit_new(parent).await.expect("submit");

    let err = handle.get().await.expect_err("sequence must fail");
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert_eq!(err.user_message(), "boom");

    let record = handle.record().expect("record");
    let last = mgmt.tasks().store().get(record.children[2]).expect("third child");
    assert_eq!(last.status, TaskStatus::Cancelled);
    assert!(last.started_at.is_none());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_parallel_waits_for_all_children() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");

    let parent = TaskBuilder::new("par").parallel(vec![
        sleeper("slow", 60, json!("slow")),
        TaskBuilder::new("fails")
            .body(|_| async { Err(EngineError::Execution("child failed".to_string())) }),
        sleeper("fast", 5, json!("fast")),
    ]);
    let handle = mgmt.tasks().submit_new(parent).await.expect("submit");

    let err = handle.get().await.expect_err("aggregate must fail");
    assert_eq!(err.user_message(), "child failed");

    // the aggregate ends no earlier than any child, and every child finished
    let record = handle.record().expect("record");
    let parent_end = record.ended_at.expect("parent ended");
    for id in &record.children {
        let child = mgmt.tasks().store().get(*id).expect("child");
        assert!(child.status.is_terminal());
        assert!(parent_end >= child.ended_at.expect("child ended"));
    }
    let slow = mgmt.tasks().store().get(record.children[0]).expect("slow child");
    assert_eq!(slow.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_parallel_success_collects_results() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");

    let parent = TaskBuilder::new("par").parallel(vec![
        sleeper("a", 30, json!("a")),
        sleeper("b", 10, json!("b")),
    ]);
    let started = tokio::time::Instant::now();
    let handle = mgmt.tasks().submit_new(parent).await.expect("submit");

    assert_eq!(handle.get().await.expect("result"), json!(["a", "b"]));
    // concurrent, so well under the sum of the children
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let handle = mgmt
        .tasks()
        .create(TaskBuilder::new("idle").body(|_| async { Ok(json!("ran")) }));

    assert_eq!(handle.status(), TaskStatus::Unsubmitted);
    assert!(handle.cancel());

    let record = handle.record().expect("record");
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert!(record.started_at.is_none());

    // a finished task cannot be cancelled again or submitted
    assert!(!handle.cancel());
    let err = handle.submit().await.expect_err("cancelled task cannot be submitted");
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[tokio::test]
async fn test_cancel_mid_sequence_cancels_pending_children() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let parent = TaskBuilder::new("seq").tag("rollout").sequential(vec![
        sleeper("a", 200, json!("a")),
        sleeper("b", 200, json!("b")),
        sleeper("c", 200, json!("c")),
    ]);
    let handle = mgmt.tasks().submit_new(parent).await.expect("submit");

    // 1. Cancel while the first child sleeps
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.cancel());
    let err = handle.get().await.expect_err("cancelled");
    assert!(matches!(err, EngineError::Cancelled));

    // 2. Every child ends up terminal; the later ones never started
    let children = handle.record().expect("record").children;
    let store = mgmt.tasks().store();
    for _ in 0..100 {
        if children.iter().all(|c| store.status(*c).is_some_and(|s| s.is_terminal())) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for child in &children {
        assert_eq!(store.status(*child), Some(TaskStatus::Cancelled));
    }
    for later in &children[1..] {
        assert!(store.get(*later).expect("child").started_at.is_none());
    }

    // 3. Nothing is left dangling for gc
    mgmt.tasks().gc_completed();
    assert!(store.tasks_with_tag("rollout").is_empty());
}

#[tokio::test]
async fn test_cancel_running_task() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let handle = mgmt
        .tasks()
        .submit_new(sleeper("long", 5_000, Value::Null))
        .await
        .expect("submit");

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(handle.cancel());

    let err = handle.get().await.expect_err("cancelled");
    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(handle.status(), TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_task_timeout() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let handle = mgmt
        .tasks()
        .submit_new(sleeper("slow", 5_000, Value::Null).timeout(Duration::from_millis(30)))
        .await
        .expect("submit");

    let err = handle.get().await.expect_err("must time out");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(handle.status(), TaskStatus::Failure);
}

#[tokio::test]
async fn test_validator_rejects_before_start() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let handle = mgmt
        .tasks()
        .submit_new(
            TaskBuilder::new("invalid")
                .validate(|| Err(EngineError::IllegalArgument("bad config".to_string())))
                .body(|_| async { Ok(Value::Null) }),
        )
        .await
        .expect("submit");

    let err = handle.get().await.expect_err("rejected");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    let record = handle.record().expect("record");
    assert_eq!(record.status, TaskStatus::Failure);
    assert!(record.started_at.is_none());
}

#[tokio::test]
async fn test_tags_and_gc() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    for i in 0..3 {
        mgmt.tasks()
            .submit_new(TaskBuilder::new(format!("t{}", i)).tag("batch").body(|_| async { Ok(Value::Null) }))
            .await
            .expect("submit")
            .get()
            .await
            .expect("run");
    }
    assert_eq!(mgmt.tasks().store().tasks_with_tag("batch").len(), 3);

    assert!(mgmt.tasks().gc_completed() >= 3);
    assert!(mgmt.tasks().store().tasks_with_tag("batch").is_empty());
}
