use std::sync::Arc;
use std::time::Duration;

use helmsman::entity::{Entity, EntitySpec};
use helmsman::error::{EngineError, ErrorKind};
use helmsman::runtime::effector::{Effector, ParameterType};
use helmsman::runtime::invocation::{
    EFFECTOR_TAG, effector_tag, invocation_parallel, invocation_sequential, invoke,
};
use helmsman::runtime::task::TaskStatus;
use helmsman::{EngineConfig, ManagementContext};
use serde_json::{Map, Value, json};

fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn entity(mgmt: &ManagementContext, name: &str) -> Arc<Entity> {
    mgmt.create_entity(EntitySpec::of_type("test.Node").display_name(name))
        .expect("entity")
}

#[tokio::test]
async fn test_invoke_applies_defaults_and_coercion() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let node = entity(&mgmt, "node");
    let effector = node.add_effector(
        Effector::from_fn("resize", |inv| async move { Ok(Value::Object(inv.params)) })
            .parameter(ParameterType::new("size", "integer").default_value(2))
            .parameter(ParameterType::new("zone", "string").default_value("eu-west")),
    );

    let handle = invoke(&mgmt, &node, &effector, params(&[("size", json!("5"))])).expect("invoke");
    assert_eq!(handle.status(), TaskStatus::Unsubmitted);
    handle.submit().await.expect("submit");

    let result = handle.get().await.expect("result");
    assert_eq!(result, json!({"size": 5, "zone": "eu-west"}));

    let record = handle.record().expect("record");
    assert!(record.tags.contains(EFFECTOR_TAG));
    assert!(record.tags.contains("effector:resize"));
    assert!(record.tags.contains(&format!("entity:{}", node.id())));
}

#[tokio::test]
async fn test_invalid_parameter_is_rejected() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let node = entity(&mgmt, "node");
    let effector = node.add_effector(
        Effector::from_fn("resize", |_| async { Ok(Value::Null) })
            .parameter(ParameterType::new("size", "integer").required()),
    );

    let err = invoke(&mgmt, &node, &effector, params(&[("size", json!("many"))]))
        .err()
        .expect("not an integer");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);

    let err = invoke(&mgmt, &node, &effector, Map::new()).err().expect("missing");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[tokio::test]
async fn test_registered_override_wins() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let node = entity(&mgmt, "node");

    // the caller holds a generic declaration; the entity registers its own body
    let declared = Arc::new(Effector::from_fn("start", |_| async { Ok(json!("generic")) }));
    node.add_effector(Effector::from_fn("start", |inv| async move {
        Ok(json!(format!("started {}", inv.entity.display_name())))
    }));

    let handle = invoke(&mgmt, &node, &declared, Map::new()).expect("invoke");
    handle.submit().await.expect("submit");
    assert_eq!(handle.get().await.expect("result"), json!("started node"));
}

#[test]
fn test_signature_and_instance_equality() {
    let port = || ParameterType::new("port", "integer").default_value(80);
    let declared = Effector::new("restart").returns("string").parameter(port());
    let implemented = Effector::from_fn("restart", |_| async { Ok(json!("ok")) })
        .returns("string")
        .parameter(port());
    // bodies are not part of the signature
    assert!(declared.same_signature(&implemented));

    let widened = Effector::new("restart")
        .returns("string")
        .parameter(port())
        .parameter(ParameterType::new("force", "boolean"));
    assert!(!declared.same_signature(&widened));
    assert!(!declared.same_signature(&Effector::new("restart").parameter(port())));

    let a = Arc::new(declared);
    let b = Arc::new(implemented);
    assert!(Effector::same_instance(&a, &a.clone()));
    assert!(!Effector::same_instance(&a, &b));
}

#[tokio::test]
async fn test_missing_body_is_unsupported() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let node = entity(&mgmt, "node");
    let declared = Arc::new(Effector::new("stop"));

    let err = invoke(&mgmt, &node, &declared, Map::new())
        .err()
        .expect("no body anywhere");
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
}

#[tokio::test]
async fn test_effector_by_ids() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let node = entity(&mgmt, "node");
    node.add_effector(Effector::from_fn("ping", |_| async { Ok(json!("pong")) }));

    let task_id = mgmt
        .invoke_effector(node.id(), "ping", Map::new())
        .await
        .expect("invoke");
    let value = mgmt.tasks().wait(task_id).await.expect("wait");
    assert_eq!(value, json!("pong"));
    let summary = mgmt.task_summary(task_id).expect("summary");
    assert_eq!(summary.status, TaskStatus::Success);

    let err = mgmt
        .invoke_effector(node.id(), "missing", Map::new())
        .await
        .expect_err("unknown effector");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_invocation_parallel_over_entities() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let nodes: Vec<_> = (0..3).map(|i| entity(&mgmt, &format!("n{}", i))).collect();
    let effector = Arc::new(Effector::from_fn("name", |inv| async move {
        inv.task.sleep(Duration::from_millis(10)).await?;
        Ok(json!(inv.entity.display_name()))
    }));

    let handle = invocation_parallel(&mgmt, &effector, Map::new(), &nodes).expect("fan out");
    handle.submit().await.expect("submit");
    assert_eq!(handle.get().await.expect("result"), json!(["n0", "n1", "n2"]));
}

#[tokio::test]
async fn test_bad_parameters_reject_whole_fan_out() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let nodes: Vec<_> = (0..3).map(|i| entity(&mgmt, &format!("n{}", i))).collect();
    let effector = Arc::new(Effector::from_fn("scale", |_| async { Ok(Value::Null) }));
    // only n1 declares a required parameter
    nodes[1].add_effector(
        Effector::from_fn("scale", |_| async { Ok(Value::Null) })
            .parameter(ParameterType::new("replicas", "integer").required()),
    );

    let err = invocation_parallel(&mgmt, &effector, Map::new(), &nodes)
        .err()
        .expect("n1 rejects");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    let err = invocation_sequential(&mgmt, &effector, Map::new(), &nodes)
        .err()
        .expect("n1 rejects");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);

    // no child was created for any entity
    assert!(mgmt.tasks().store().tasks_with_tag(&effector_tag("scale")).is_empty());
    assert!(mgmt.tasks().store().tasks_with_tag(EFFECTOR_TAG).is_empty());
}

#[tokio::test]
async fn test_invocation_parallel_reports_failure_after_all() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let nodes: Vec<_> = (0..3).map(|i| entity(&mgmt, &format!("n{}", i))).collect();
    let effector = Arc::new(Effector::from_fn("check", |inv| async move {
        if inv.entity.display_name() == "n1" {
            return Err(EngineError::Execution("n1 unhealthy".to_string()));
        }
        inv.task.sleep(Duration::from_millis(30)).await?;
        Ok(Value::Bool(true))
    }));

    let handle = invocation_parallel(&mgmt, &effector, Map::new(), &nodes).expect("fan out");
    handle.submit().await.expect("submit");
    let err = handle.get().await.expect_err("one child failed");
    assert_eq!(err.user_message(), "n1 unhealthy");

    let record = handle.record().expect("record");
    let statuses: Vec<_> = record
        .children
        .iter()
        .map(|id| mgmt.tasks().store().status(*id).expect("child"))
        .collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Success, TaskStatus::Failure, TaskStatus::Success]
    );
}

#[tokio::test]
async fn test_invocation_sequential_stops_at_first_failure() {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    let nodes: Vec<_> = (0..3).map(|i| entity(&mgmt, &format!("n{}", i))).collect();
    let effector = Arc::new(Effector::from_fn("upgrade", |inv| async move {
        if inv.entity.display_name() == "n1" {
            return Err(EngineError::Execution("upgrade failed".to_string()));
        }
        inv.entity.set_sensor("upgraded", Value::Bool(true));
        Ok(Value::Null)
    }));

    let handle = invocation_sequential(&mgmt, &effector, Map::new(), &nodes).expect("fan out");
    handle.submit().await.expect("submit");
    handle.get().await.expect_err("second child fails");

    assert_eq!(nodes[0].sensor("upgraded"), Some(Value::Bool(true)));
    assert_eq!(nodes[2].sensor("upgraded"), None);
    let record = handle.record().expect("record");
    let last = mgmt.tasks().store().get(record.children[2]).expect("third");
    assert!(last.started_at.is_none());
}
