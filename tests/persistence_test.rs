use std::sync::Arc;
use std::time::Duration;

use helmsman::entity::{Entity, EntitySpec};
use helmsman::feed::source::PollConfig;
use helmsman::feed::{CommandPoll, Feed, PollSource};
use helmsman::persistence::{
    BrooklynObjectType, CompoundTransformer, EntityMemento, FeedMemento, FileMementoStore,
    InMemoryMementoStore, MementoRawData, MementoStore, Persister, RebindManager,
};
use helmsman::runtime::effector::Effector;
use helmsman::workflow::{StepRecord, StepState, WorkflowBuilder, WorkflowStatus};
use helmsman::{EngineConfig, ManagementContext};
use serde_json::{Map, Value, json};

const SERVER: &str = "test.Server";

/// Installs what every server gets: an effector and an in-process feed.
fn register_server(mgmt: &ManagementContext, type_name: &str) {
    mgmt.entity_types().register(type_name, |mgmt, entity| {
        entity.add_effector(Effector::from_fn("ping", |_| async { Ok(json!("pong")) }));
        Feed::builder(mgmt, entity)
            .period(Duration::from_millis(20))
            .poll(PollConfig::new(
                "uptime",
                PollSource::function("clock", || async { Ok(json!(1)) }),
            ))
            .attach()?;
        Ok(())
    });
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn new_context() -> ManagementContext {
    let mgmt = ManagementContext::new(EngineConfig::default()).expect("context");
    register_server(&mgmt, SERVER);
    mgmt
}

fn server(mgmt: &ManagementContext) -> Arc<Entity> {
    let entity = mgmt
        .create_entity(
            EntitySpec::of_type(SERVER)
                .display_name("web-1")
                .catalog_item_id("web:1.0"),
        )
        .expect("entity");
    entity.set_sensor("http.port", json!(8080));
    Feed::builder(mgmt, &entity)
        .unique_tag("status")
        .period(Duration::from_secs(30))
        .poll(PollConfig::new(
            "service.up",
            PollSource::Command(CommandPoll::new("systemctl").arg("is-active").arg("web")),
        ))
        .suspended(true)
        .attach()
        .expect("command feed");
    mgmt.manage(&entity).expect("manage");
    entity
}

#[tokio::test]
async fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileMementoStore::new(dir.path());

    // 1. Nothing there yet
    assert!(store.load_raw_data().await.expect("empty load").is_empty());

    // 2. Write objects whose ids are not valid file names
    store
        .write(BrooklynObjectType::Entity, "e1", "<entity/>\n")
        .await
        .expect("write entity");
    store
        .write(BrooklynObjectType::Feed, "e1:FunctionFeed[load:cpu]", "<feed/>\n")
        .await
        .expect("write feed");
    store.write_bundle_jar("web:1.0", &[0xCA, 0xFE]).await.expect("jar");
    store.write_plane_id("plane-7").await.expect("plane id");

    // 3. Debris and unrecognised groups
    std::fs::write(dir.path().join("entities").join("half.tmp"), "partial").expect("tmp");
    std::fs::create_dir_all(dir.path().join("widgets")).expect("unknown dir");
    std::fs::write(dir.path().join("widgets").join("w1"), "<widget/>").expect("unknown");

    let raw = store.load_raw_data().await.expect("load");
    assert_eq!(raw.plane_id.as_deref(), Some("plane-7"));
    assert_eq!(raw.ids(BrooklynObjectType::Entity), vec!["e1".to_string()]);
    assert_eq!(
        raw.get(BrooklynObjectType::Feed, "e1:FunctionFeed[load:cpu]"),
        Some("<feed/>\n")
    );
    assert_eq!(raw.bundle_jars.get("web:1.0"), Some(&vec![0xCA, 0xFE]));
    assert_eq!(
        raw.unknown.get("widgets").and_then(|g| g.get("w1")).map(String::as_str),
        Some("<widget/>")
    );

    // 4. Deletes, including ones that are already gone
    store.delete(BrooklynObjectType::Entity, "e1").await.expect("delete");
    store.delete(BrooklynObjectType::Entity, "e1").await.expect("delete again");
    store.delete_bundle_jar("web:1.0").await.expect("delete jar");
    let raw = store.load_raw_data().await.expect("reload");
    assert!(raw.ids(BrooklynObjectType::Entity).is_empty());
    assert!(raw.bundle_jars.is_empty());
}

#[tokio::test]
async fn test_file_store_ids_with_reserved_suffixes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileMementoStore::new(dir.path());

    // 1. Ids that look like store debris or bundle archives
    store
        .write(BrooklynObjectType::Entity, "notes.tmp", "<entity/>\n")
        .await
        .expect("write tmp-like id");
    store
        .write(BrooklynObjectType::ManagedBundle, "web-1.0.jar", "<bundle/>\n")
        .await
        .expect("write jar-like id");
    store.write_bundle_jar("web-1.0", &[0x01]).await.expect("jar");

    // 2. Each comes back as what it was written as
    let raw = store.load_raw_data().await.expect("load");
    assert_eq!(raw.ids(BrooklynObjectType::Entity), vec!["notes.tmp".to_string()]);
    assert_eq!(
        raw.get(BrooklynObjectType::ManagedBundle, "web-1.0.jar"),
        Some("<bundle/>\n")
    );
    assert_eq!(raw.bundle_jars.len(), 1);
    assert_eq!(raw.bundle_jars.get("web-1.0"), Some(&vec![0x01]));
}

#[tokio::test]
async fn test_entity_memento_xml() {
    let mgmt = new_context();
    let entity = server(&mgmt);

    let memento = EntityMemento::of(&entity, Vec::new());
    let xml = memento.to_xml().expect("xml");
    assert!(xml.contains("<type>test.Server</type>"));
    assert!(xml.contains("<catalogItemId>web:1.0</catalogItemId>"));

    let parsed = EntityMemento::from_xml(&xml).expect("parse");
    assert_eq!(parsed, memento);
    assert_eq!(parsed.sensors.get("http.port"), Some(&json!(8080)));
    assert!(parsed.managed);
    assert_eq!(parsed.feeds.len(), 2);

    assert!(EntityMemento::from_xml("<feed><id>x</id></feed>").is_err());
}

#[tokio::test]
async fn test_checkpoint_writes_and_deletes() {
    let mgmt = new_context();
    let entity = server(&mgmt);
    let store: Arc<dyn MementoStore> = Arc::new(InMemoryMementoStore::new());
    let persister = Persister::new(mgmt.clone(), store.clone());
    assert!(wait_for(|| entity.sensor("uptime").is_some()).await);

    // 1. First checkpoint writes the entity and both feeds
    let delta = persister.checkpoint().await.expect("checkpoint");
    assert_eq!(delta.writes.len(), 3);
    let raw = store.load_raw_data().await.expect("load");
    assert_eq!(raw.plane_id, Some(mgmt.plane_id()));
    let feed_id = FeedMemento::id_for(entity.id(), "status");
    assert!(raw.get(BrooklynObjectType::Feed, &feed_id).is_some());

    // 2. Nothing changed, nothing written
    assert!(persister.checkpoint().await.expect("checkpoint").is_empty());

    // 3. A sensor change rewrites only the entity
    entity.set_sensor("http.port", json!(9090));
    let delta = persister.checkpoint().await.expect("checkpoint");
    assert_eq!(delta.writes.len(), 1);
    assert_eq!(delta.writes[0].0, BrooklynObjectType::Entity);

    // 4. Unmanaged entities and their feeds are removed
    mgmt.unmanage(entity.id());
    let delta = persister.checkpoint().await.expect("checkpoint");
    assert_eq!(delta.deletes.len(), 3);
    let raw = store.load_raw_data().await.expect("load");
    assert!(raw.ids(BrooklynObjectType::Entity).is_empty());
    assert!(raw.ids(BrooklynObjectType::Feed).is_empty());
}

#[tokio::test]
async fn test_checkpoint_leaves_other_groups_alone() {
    let mut seeded = MementoRawData::new();
    seeded.put(BrooklynObjectType::CatalogItem, "web:1.0", "<catalogItem/>\n");
    seeded.bundle_jars.insert("web-bundle".to_string(), vec![1]);
    let store: Arc<dyn MementoStore> = Arc::new(InMemoryMementoStore::with_data(seeded));

    let mgmt = new_context();
    server(&mgmt);
    Persister::new(mgmt, store.clone())
        .checkpoint()
        .await
        .expect("checkpoint");

    let raw = store.load_raw_data().await.expect("load");
    assert_eq!(
        raw.get(BrooklynObjectType::CatalogItem, "web:1.0"),
        Some("<catalogItem/>\n")
    );
    assert_eq!(raw.bundle_jars.len(), 1);
    assert_eq!(raw.ids(BrooklynObjectType::Entity).len(), 1);
}

#[tokio::test]
async fn test_rebind_restores_entities_feeds_and_workflows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn MementoStore> = Arc::new(FileMementoStore::new(dir.path()));

    // 1. First management plane: run a workflow, persist
    let first = new_context();
    let entity = server(&first);
    let entity_id = entity.id().to_string();
    let plane_id = first.plane_id();
    let workflow = WorkflowBuilder::new("configure").let_var("x", 1).build();
    first
        .workflow_executor()
        .run(&entity, &workflow, Map::new())
        .await
        .expect("workflow");
    let persister = Persister::new(first.clone(), store.clone());
    persister.checkpoint().await.expect("checkpoint");
    first.shutdown();

    // 2. Second plane rebinds from the same directory
    let second = new_context();
    let report = RebindManager::new(second.clone(), store.clone())
        .rebind()
        .await
        .expect("rebind");

    assert_eq!(report.plane_id.as_deref(), Some(plane_id.as_str()));
    assert_eq!(second.plane_id(), plane_id);
    assert_eq!(report.entities, vec![entity_id.clone()]);
    assert_eq!(report.feeds_restored.len(), 2);
    assert!(report.feeds_skipped.is_empty());
    assert_eq!(report.workflows_restored, 1);
    assert!(report.workflows_resumed.is_empty());

    let restored = second.entities().require(&entity_id).expect("entity");
    assert!(restored.is_managed());
    assert_eq!(restored.display_name(), "web-1");
    assert_eq!(restored.catalog_item_id().as_deref(), Some("web:1.0"));
    assert_eq!(restored.sensor("http.port"), Some(json!(8080)));
    assert!(restored.effector("ping").is_some());

    // the persisted command feed comes back suspended; the initializer's feed runs
    let status = restored.feed("status").expect("command feed");
    assert!(status.is_activated());
    assert!(status.is_suspended());
    let clock = restored
        .feed("FunctionFeed[clock:uptime]")
        .expect("function feed");
    assert!(clock.is_running());

    let workflows = second.workflows().for_entity(&entity_id);
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].status, WorkflowStatus::Completed);
    assert_eq!(workflows[0].vars.get("x"), Some(&json!(1)));
}

#[tokio::test]
async fn test_rebind_skips_function_feed_without_initializer() {
    let store: Arc<dyn MementoStore> = Arc::new(InMemoryMementoStore::new());
    let first = new_context();
    let entity = first
        .create_entity(EntitySpec::of_type("test.Bare"))
        .expect("entity");
    Feed::builder(&first, &entity)
        .poll(PollConfig::new(
            "x",
            PollSource::function("adhoc", || async { Ok(Value::Null) }),
        ))
        .attach()
        .expect("feed");
    first.manage(&entity).expect("manage");
    Persister::new(first.clone(), store.clone())
        .checkpoint()
        .await
        .expect("checkpoint");

    let second = new_context();
    let report = RebindManager::new(second.clone(), store)
        .rebind()
        .await
        .expect("rebind");
    assert_eq!(report.entities.len(), 1);
    assert_eq!(report.feeds_skipped.len(), 1);
    assert!(report.feeds_restored.is_empty());
}

#[tokio::test]
async fn test_rebind_with_transformer() {
    let store: Arc<dyn MementoStore> = Arc::new(InMemoryMementoStore::new());
    let first = new_context();
    let entity_id = server(&first).id().to_string();
    Persister::new(first.clone(), store.clone())
        .checkpoint()
        .await
        .expect("checkpoint");

    let second = ManagementContext::new(EngineConfig::default()).expect("context");
    register_server(&second, "test.WebServer");
    let transformer = CompoundTransformer::builder()
        .rename_type(SERVER, "test.WebServer")
        .build()
        .expect("transformer");
    RebindManager::new(second.clone(), store.clone())
        .with_transformer(transformer)
        .rebind()
        .await
        .expect("rebind");

    let restored = second.entities().require(&entity_id).expect("entity");
    assert_eq!(restored.type_name(), "test.WebServer");
    assert!(restored.effector("ping").is_some());

    // the store itself was not rewritten
    let raw = store.load_raw_data().await.expect("load");
    assert!(
        raw.get(BrooklynObjectType::Entity, &entity_id)
            .is_some_and(|c| c.contains("<type>test.Server</type>"))
    );
}

#[tokio::test]
async fn test_rebind_resumes_interrupted_workflows() {
    let store: Arc<dyn MementoStore> = Arc::new(InMemoryMementoStore::new());
    let first = new_context();
    let entity = server(&first);
    let executor = first.workflow_executor();

    // 1. One run stopped mid-sleep, one mid-effector
    let resumable = WorkflowBuilder::new("resumable")
        .let_var("x", 41)
        .sleep("10ms")
        .return_value("${x} + 1")
        .build();
    let ambiguous = WorkflowBuilder::new("ambiguous").no_op().invoke("ping").build();
    let mut ids = Vec::new();
    for definition in [&resumable, &ambiguous] {
        let ctx = executor
            .create(&entity, definition, Map::new(), None)
            .expect("create");
        first
            .workflows()
            .update(&ctx.id, |c| {
                let mut done = StepRecord::new(0, None, Value::Null);
                done.state = StepState::Completed;
                done.output = Some(Value::Null);
                let mut vars = Map::new();
                vars.insert("x".to_string(), json!(41));
                done.vars_after = Some(vars.clone());
                c.vars = vars;
                c.records.insert(0, done);
                c.records.insert(1, StepRecord::new(1, None, Value::Null));
                c.current_step = Some(1);
                c.status = WorkflowStatus::Running;
            })
            .expect("update");
        ids.push(ctx.id);
    }
    Persister::new(first.clone(), store.clone())
        .checkpoint()
        .await
        .expect("checkpoint");
    first.shutdown();

    // 2. Rebind resumes what it safely can
    let second = new_context();
    let report = RebindManager::new(second.clone(), store)
        .rebind()
        .await
        .expect("rebind");
    assert_eq!(report.workflows_restored, 2);
    assert_eq!(report.workflows_resumed, vec![ids[0].clone()]);
    assert!(report.workflows_failed.contains_key(&ids[1]));

    let mut resumed = second.workflows().require(&ids[0]).expect("resumed");
    for _ in 0..100 {
        if resumed.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        resumed = second.workflows().require(&ids[0]).expect("resumed");
    }
    assert_eq!(resumed.status, WorkflowStatus::Completed);
    assert_eq!(resumed.output, Some(json!(42)));

    let failed = second.workflows().require(&ids[1]).expect("failed");
    assert_eq!(failed.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_persister_follows_workflow_boundaries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = EngineConfig::default();
    config.persistence.dir = Some(dir.path().to_path_buf());
    config.persistence.period_ms = 60_000;
    let mgmt = ManagementContext::new(config).expect("context");
    register_server(&mgmt, SERVER);
    let store = helmsman::persistence::open_store(&mgmt.config().persistence)
        .expect("open")
        .expect("configured");

    let persister = Persister::new(mgmt.clone(), store.clone());
    persister.start();
    let entity = server(&mgmt);

    // the periodic loop is far off; the workflow sink writes at each step
    let workflow = WorkflowBuilder::new("tracked").let_var("done", true).build();
    mgmt.workflow_executor()
        .run(&entity, &workflow, Map::new())
        .await
        .expect("workflow");

    let raw = store.load_raw_data().await.expect("load");
    let xml = raw
        .get(BrooklynObjectType::Entity, entity.id())
        .expect("entity persisted");
    let memento = EntityMemento::from_xml(xml).expect("parse");
    assert_eq!(memento.workflows.len(), 1);
    assert_eq!(memento.workflows[0].status, WorkflowStatus::Completed);

    persister.stop().await.expect("stop");
}
