use helmsman::error::ErrorKind;
use helmsman::workflow::StepKind;
use helmsman::workflow::loader::parse_workflow_yaml;
use helmsman::workflow::registry::StepRegistry;
use helmsman::workflow::shorthand::ShorthandTemplate;
use serde_json::{Map, json};

fn registry() -> StepRegistry {
    StepRegistry::with_builtins().expect("builtins")
}

#[test]
fn test_template_captures_rest_and_optional_group() {
    let template = ShorthandTemplate::parse("${variable} [ \"=\" ${value...} ]").expect("template");

    let full = template.apply("x = 1 + 2").expect("match");
    assert_eq!(full.get("variable").map(String::as_str), Some("x"));
    assert_eq!(full.get("value").map(String::as_str), Some("1 + 2"));

    let bare = template.apply("x").expect("optional group omitted");
    assert_eq!(bare.get("variable").map(String::as_str), Some("x"));
    assert!(!bare.contains_key("value"));
}

#[test]
fn test_template_quoted_token() {
    let template = ShorthandTemplate::parse("${message...}").expect("template");
    let captured = template.apply("\"hello \\\"there\\\"\"").expect("match");
    assert_eq!(captured.get("message").map(String::as_str), Some("hello \"there\""));
}

#[test]
fn test_template_mismatch() {
    let template = ShorthandTemplate::parse("${effector} [ \"on\" ${entity} ]").expect("template");
    let err = template.apply("restart at e1").expect_err("literal mismatch");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);

    let err = ShorthandTemplate::parse("[ ${a}").expect_err("unclosed group");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[test]
fn test_parse_shorthand_steps() {
    let registry = registry();

    assert_eq!(
        registry.parse_shorthand("sleep 50ms").expect("sleep"),
        StepKind::Sleep {
            duration: Some(json!("50ms"))
        }
    );
    assert_eq!(
        registry.parse_shorthand("log hello world").expect("log"),
        StepKind::Log {
            message: Some("hello world".to_string()),
            level: None
        }
    );
    assert_eq!(
        registry.parse_shorthand("let x = ${input.n} + 1").expect("let"),
        StepKind::Let {
            variable: Some("x".to_string()),
            value: Some(json!("${input.n} + 1"))
        }
    );
    assert_eq!(
        registry.parse_shorthand("invoke-effector restart on e1").expect("invoke"),
        StepKind::InvokeEffector {
            effector: Some("restart".to_string()),
            entity: Some("e1".to_string()),
            args: Map::new()
        }
    );
    assert_eq!(
        registry.parse_shorthand("noop").expect("alias"),
        StepKind::NoOp {}
    );
    assert_eq!(
        registry.parse_shorthand("return").expect("bare return"),
        StepKind::Return { value: None }
    );
}

#[test]
fn test_unknown_step_type() {
    let err = registry().parse_shorthand("teleport now").expect_err("unknown");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[test]
fn test_aliases() {
    let registry = registry();
    assert_eq!(registry.resolve("invoke").as_deref(), Some("invoke-effector"));
    assert_eq!(registry.resolve("set-variable").as_deref(), Some("let"));

    registry.register_alias("pause", "sleep").expect("alias");
    assert!(registry.is_registered("pause"));
    assert!(registry.register_alias("x", "missing").is_err());
}

#[test]
fn test_parse_step_map_forms() {
    let registry = registry();

    // shorthand plus explicit overrides
    let step = registry
        .parse_step(&json!({"step": "sleep 1s", "id": "wait", "timeout": "5s"}))
        .expect("step form");
    assert_eq!(step.id.as_deref(), Some("wait"));
    assert_eq!(step.timeout.as_deref(), Some("5s"));
    assert_eq!(step.kind, StepKind::Sleep { duration: Some(json!("1s")) });

    // explicit type with an alias and a nested workflow
    let step = registry
        .parse_step(&json!({
            "type": "subworkflow",
            "steps": ["log inner", {"type": "return", "value": 3}]
        }))
        .expect("type form");
    let StepKind::Workflow { steps } = step.kind else {
        panic!("expected a workflow step");
    };
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].kind, StepKind::Return { value: Some(json!(3)) });

    let err = registry.parse_step(&json!({"id": "x"})).expect_err("no type");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    let err = registry.parse_step(&json!(42)).expect_err("not a step");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[test]
fn test_idempotency_defaults() {
    let registry = registry();
    let effector = registry.parse_step(&json!("invoke-effector restart")).expect("step");
    assert!(!effector.is_idempotent());

    let forced = registry
        .parse_step(&json!({"step": "invoke-effector restart", "idempotent": true}))
        .expect("step");
    assert!(forced.is_idempotent());

    let sleep = registry.parse_step(&json!("sleep 1s")).expect("step");
    assert!(sleep.is_idempotent());
}

#[test]
fn test_parse_workflow_yaml() {
    let yaml = r#"
name: deploy
input:
  replicas: 2
steps:
  - log deploying ${input.replicas} replicas
  - step: let total = ${input.replicas} * 2
    id: compute
  - type: set-sensor
    sensor: replicas.total
    value: ${total}
  - return ${total}
"#;
    let loaded = parse_workflow_yaml(&registry(), yaml).expect("workflow");
    assert_eq!(loaded.definition.name, "deploy");
    assert_eq!(loaded.definition.steps.len(), 4);
    assert_eq!(loaded.input.get("replicas"), Some(&json!(2)));
    assert_eq!(loaded.definition.steps[1].id.as_deref(), Some("compute"));
    assert_eq!(loaded.definition.steps[2].kind.discriminator(), "set-sensor");

    let err = parse_workflow_yaml(&registry(), "name: x\nsteps: [\"bogus step\"]").expect_err("bad step");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}
