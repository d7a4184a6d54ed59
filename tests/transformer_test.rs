use helmsman::error::ErrorKind;
use helmsman::persistence::{
    BrooklynObjectType, CompoundTransformer, CompoundTransformerLoader, InMemoryMementoStore,
    MementoRawData, MementoStore, RuleSpec,
};

const ENTITY_XML: &str = r#"<entity>
  <id>e1</id>
  <type>old.Type</type>
  <displayName>web</displayName>
  <catalogItemId>app:1.0</catalogItemId>
  <legacyConfig>
    <port>8080</port>
  </legacyConfig>
  <sensors>
    <sensor name="note">"old.Type stays in prose"</sensor>
  </sensors>
</entity>
"#;

fn sample() -> MementoRawData {
    let mut raw = MementoRawData::new().with_plane_id("plane-1");
    raw.put(BrooklynObjectType::Entity, "e1", ENTITY_XML);
    raw.put(
        BrooklynObjectType::Entity,
        "e2",
        "<entity>\n  <id>e2</id>\n  <type>other.Type</type>\n</entity>\n",
    );
    raw.put(
        BrooklynObjectType::Policy,
        "p1",
        "<policy type=\"old.Type\">\n  <old.Config>\n    <threshold>3</threshold>\n  </old.Config>\n</policy>\n",
    );
    raw.put(BrooklynObjectType::CatalogItem, "app:1.0", "<catalogItem/>\n");
    raw.bundle_jars.insert("bundle-a".to_string(), vec![1, 2, 3]);
    raw
}

#[test]
fn test_empty_transformer_is_identity() {
    let raw = sample();
    let transformer = CompoundTransformer::builder().build().expect("build");
    assert!(transformer.is_empty());

    let out = transformer.transform(&raw).expect("transform");
    assert_eq!(out, raw);
    assert_eq!(
        out.get(BrooklynObjectType::Entity, "e1").map(str::as_bytes),
        Some(ENTITY_XML.as_bytes())
    );
}

#[test]
fn test_rename_type_changes_only_exact_matches() {
    let raw = sample();
    let transformer = CompoundTransformer::builder()
        .rename_type("old.Type", "new.Type")
        .build()
        .expect("build");
    let out = transformer.transform(&raw).expect("transform");

    let expected = ENTITY_XML.replace("<type>old.Type</type>", "<type>new.Type</type>");
    assert_eq!(out.get(BrooklynObjectType::Entity, "e1"), Some(expected.as_str()));
    // prose mentioning the type is not an element value and is left alone
    assert!(expected.contains("old.Type stays in prose"));

    assert_eq!(
        out.get(BrooklynObjectType::Entity, "e2"),
        raw.get(BrooklynObjectType::Entity, "e2")
    );
    let policy = out.get(BrooklynObjectType::Policy, "p1").expect("policy");
    assert!(policy.starts_with("<policy type=\"new.Type\">"));
}

#[test]
fn test_deleting_missing_ids_is_not_an_error() {
    let raw = sample();
    let transformer = CompoundTransformer::builder()
        .delete_entity("e2")
        .delete_entity("does-not-exist")
        .delete(BrooklynObjectType::ManagedBundle, ["bundle-a", "bundle-z"])
        .build()
        .expect("build");
    let out = transformer.transform(&raw).expect("transform");

    assert!(out.get(BrooklynObjectType::Entity, "e2").is_none());
    assert!(out.get(BrooklynObjectType::Entity, "e1").is_some());
    assert!(out.bundle_jars.is_empty());
    // the input snapshot is untouched
    assert!(raw.get(BrooklynObjectType::Entity, "e2").is_some());
}

#[test]
fn test_class_tag_field_and_catalog_rules() {
    let raw = sample();
    let transformer = CompoundTransformer::builder()
        .rename_class_tag("old.Config", "new.Config")
        .rename_field("new.Config", "threshold", "limit")
        .change_catalog_item_id("app", "1.0", "app", "2.0")
        .build()
        .expect("build");
    let out = transformer.transform(&raw).expect("transform");

    let policy = out.get(BrooklynObjectType::Policy, "p1").expect("policy");
    assert!(policy.contains("<new.Config>"));
    assert!(policy.contains("</new.Config>"));
    assert!(policy.contains("<limit>3</limit>"));
    assert!(!policy.contains("threshold"));

    let entity = out.get(BrooklynObjectType::Entity, "e1").expect("entity");
    assert!(entity.contains("<catalogItemId>app:2.0</catalogItemId>"));
}

#[test]
fn test_delete_element_removes_whole_line_block() {
    let raw = sample();
    let transformer = CompoundTransformer::builder()
        .rule_for(
            &[BrooklynObjectType::Entity],
            RuleSpec::DeleteElement {
                name: "legacyConfig".to_string(),
            },
        )
        .build()
        .expect("build");
    let out = transformer.transform(&raw).expect("transform");

    let entity = out.get(BrooklynObjectType::Entity, "e1").expect("entity");
    assert!(!entity.contains("legacyConfig"));
    assert!(!entity.contains("8080"));
    assert!(entity.contains("  <catalogItemId>app:1.0</catalogItemId>\n  <sensors>"));
}

#[test]
fn test_custom_rule_failure_names_the_object() {
    let raw = sample();
    let transformer = CompoundTransformer::builder()
        .custom(BrooklynObjectType::Policy, "reject-policies", |_| {
            Err(helmsman::error::EngineError::Execution("unsupported policy".to_string()))
        })
        .build()
        .expect("build");

    let err = transformer.transform(&raw).expect_err("custom rule fails");
    assert_eq!(err.kind(), ErrorKind::Transform);
    assert!(err.user_message().contains("p1"));
    assert!(err.user_message().contains("unsupported policy"));
}

#[test]
fn test_invalid_pattern_fails_build() {
    let err = CompoundTransformer::builder()
        .xml_replace_text("(unclosed", "x")
        .build()
        .expect_err("bad regex");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[test]
fn test_loader_reads_yaml_rules() {
    let yaml = r#"
deletions:
  entity: [e2]
  managed-bundle: [bundle-a]
rules:
  - op: rename-type
    from: old.Type
    to: new.Type
  - op: xml-replace-text
    pattern: "<port>8080</port>"
    replacement: "<port>9090</port>"
    types: [entity]
"#;
    let transformer = CompoundTransformerLoader::from_yaml(yaml)
        .expect("parse")
        .build()
        .expect("build");
    let out = transformer.transform(&sample()).expect("transform");

    let entity = out.get(BrooklynObjectType::Entity, "e1").expect("entity");
    assert!(entity.contains("<type>new.Type</type>"));
    assert!(entity.contains("<port>9090</port>"));
    assert!(out.get(BrooklynObjectType::Entity, "e2").is_none());
    assert!(out.bundle_jars.is_empty());

    let err = CompoundTransformerLoader::from_yaml("rules:\n  - op: teleport\n").err().expect("unknown op");
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);
}

#[tokio::test]
async fn test_apply_to_store_dry_run_and_commit() {
    let store = InMemoryMementoStore::with_data(sample());
    let transformer = CompoundTransformer::builder()
        .rename_type("old.Type", "new.Type")
        .delete_entity("e2")
        .build()
        .expect("build");

    // 1. Dry run reports the batch but writes nothing
    let delta = transformer.apply_to_store(&store, true).await.expect("dry run");
    assert_eq!(delta.writes.len(), 2);
    assert_eq!(delta.deletes, vec![(BrooklynObjectType::Entity, "e2".to_string())]);
    assert_eq!(store.load_raw_data().await.expect("load"), sample());

    // 2. Commit
    transformer.apply_to_store(&store, false).await.expect("apply");
    let after = store.load_raw_data().await.expect("load");
    assert!(after.get(BrooklynObjectType::Entity, "e2").is_none());
    assert!(
        after
            .get(BrooklynObjectType::Entity, "e1")
            .is_some_and(|c| c.contains("<type>new.Type</type>"))
    );
    assert_eq!(after.plane_id.as_deref(), Some("plane-1"));

    // 3. A second pass has nothing left to do
    let again = transformer.apply_to_store(&store, false).await.expect("reapply");
    assert!(again.is_empty());
}
