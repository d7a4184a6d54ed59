use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use helmsman::entity::{Entity, EntitySpec};
use helmsman::error::ErrorKind;
use helmsman::runtime::effector::Effector;
use helmsman::workflow::{
    StepRecord, StepState, WorkflowBuilder, WorkflowDefinition, WorkflowStatus,
};
use helmsman::{EngineConfig, ManagementContext};
use serde_json::{Map, Value, json};

fn setup() -> (ManagementContext, Arc<Entity>) {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let entity = mgmt
        .create_entity(EntitySpec::of_type("test.App").display_name("app"))
        .expect("entity");
    mgmt.manage(&entity).expect("manage");
    (mgmt, entity)
}

/// Registers a run that looks like it was interrupted during `step`: every
/// earlier step completed, `step` itself only started.
fn interrupted_at(
    mgmt: &ManagementContext,
    entity: &Arc<Entity>,
    definition: &WorkflowDefinition,
    step: usize,
    vars: Map<String, Value>,
) -> String {
    let ctx = mgmt
        .workflow_executor()
        .create(entity, definition, Map::new(), None)
        .expect("create");
    mgmt.workflows()
        .update(&ctx.id, |c| {
            for index in 0..step {
                let mut done = StepRecord::new(index, None, Value::Null);
                done.state = StepState::Completed;
                done.output = Some(Value::Null);
                done.vars_after = Some(vars.clone());
                c.records.insert(index, done);
            }
            c.records
                .insert(step, StepRecord::new(step, None, Value::Null));
            c.vars = vars;
            c.current_step = Some(step);
            c.status = WorkflowStatus::Running;
        })
        .expect("update");
    ctx.id
}

#[tokio::test]
async fn test_replay_reruns_interrupted_idempotent_step() {
    let (mgmt, entity) = setup();
    let definition = WorkflowBuilder::new("resumable")
        .let_var("x", 1)
        .sleep("10ms")
        .return_value("${x} + 1")
        .build();
    let mut vars = Map::new();
    vars.insert("x".to_string(), json!(1));
    let id = interrupted_at(&mgmt, &entity, &definition, 1, vars);

    let executor = mgmt.workflow_executor();
    assert_eq!(executor.interrupted().len(), 1);

    let run = executor.replay_from_last(&id).await.expect("replay");
    assert_eq!(run.get().await.expect("result"), json!(2));

    let ctx = mgmt.workflows().require(&id).expect("context");
    assert_eq!(ctx.status, WorkflowStatus::Completed);
    assert_eq!(ctx.replay_count, 1);
    assert!(executor.interrupted().is_empty());
}

#[tokio::test]
async fn test_replay_refuses_interrupted_effector_step() {
    let (mgmt, entity) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    entity.add_effector(Effector::from_fn("charge", move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }));
    let definition = WorkflowBuilder::new("billing").no_op().invoke("charge").build();
    let id = interrupted_at(&mgmt, &entity, &definition, 1, Map::new());

    let err = mgmt
        .workflow_executor()
        .replay_from_last(&id)
        .await
        .expect_err("not idempotent");
    assert_eq!(err.kind(), ErrorKind::ReplayAmbiguous);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let ctx = mgmt.workflows().require(&id).expect("context");
    assert_eq!(ctx.status, WorkflowStatus::Failed);
    assert_eq!(
        ctx.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ReplayAmbiguous)
    );
}

#[tokio::test]
async fn test_replay_of_effector_step_marked_idempotent() {
    let (mgmt, entity) = setup();
    entity.add_effector(Effector::from_fn("refresh", |_| async { Ok(json!("fresh")) }));
    let definition = WorkflowBuilder::new("refresh")
        .no_op()
        .step(helmsman::workflow::StepKind::InvokeEffector {
            effector: Some("refresh".to_string()),
            entity: None,
            args: Map::new(),
        })
        .idempotent(true)
        .build()
        .build();
    let id = interrupted_at(&mgmt, &entity, &definition, 1, Map::new());

    let run = mgmt
        .workflow_executor()
        .replay_from_last(&id)
        .await
        .expect("replay");
    assert_eq!(run.get().await.expect("result"), json!("fresh"));
}

#[tokio::test]
async fn test_replay_from_step_uses_earlier_boundary() {
    let (mgmt, entity) = setup();
    let definition = WorkflowBuilder::new("counter")
        .let_var("x", 1)
        .let_var("x", "${x} + 1")
        .return_value("${x}")
        .build();
    let executor = mgmt.workflow_executor();
    let run = executor
        .start(&entity, &definition, Map::new())
        .await
        .expect("start");
    assert_eq!(run.get().await.expect("first run"), json!(2));

    // a completed run can't resume, but an operator may pick a step
    let err = executor
        .replay_from_last(&run.workflow_id)
        .await
        .expect_err("already completed");
    assert_eq!(err.kind(), ErrorKind::IllegalState);

    let again = executor
        .replay_from_step(&run.workflow_id, 1)
        .await
        .expect("replay from step 1");
    assert_eq!(again.get().await.expect("second run"), json!(2));
    let ctx = mgmt.workflows().require(&run.workflow_id).expect("context");
    assert_eq!(ctx.replay_count, 1);

    let err = executor
        .replay_from_step(&run.workflow_id, 7)
        .await
        .expect_err("out of range");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[tokio::test]
async fn test_replay_rejects_running_workflow() {
    let (mgmt, entity) = setup();
    let definition = WorkflowBuilder::new("busy").sleep("5s").build();
    let executor = mgmt.workflow_executor();
    let run = executor
        .start(&entity, &definition, Map::new())
        .await
        .expect("start");

    let err = executor
        .replay_from_last(&run.workflow_id)
        .await
        .expect_err("still running");
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    run.task.cancel();
}
