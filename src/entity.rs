use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::feed::Feed;
use crate::management::ManagementContext;
use crate::runtime::effector::Effector;

/// Diagnostic sensor holding the current problem of each feed, keyed by feed tag.
pub const SERVICE_PROBLEMS: &str = "service.problems";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub entity_id: String,
    pub sensor: String,
    pub value: Value,
}

/// 受管实体：效应器 (effector) 与传感器 (sensor) 的宿主
pub struct Entity {
    id: String,
    type_name: String,
    display_name: String,
    parent_id: Option<String>,
    catalog_item_id: RwLock<Option<String>>,
    effectors: DashMap<String, Arc<Effector>>,
    sensors: DashMap<String, Value>,
    events: broadcast::Sender<SensorEvent>,
    managed: AtomicBool,
    feeds: DashMap<String, Arc<Feed>>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Everything needed to construct an entity; the id is generated when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitySpec {
    pub id: Option<String>,
    pub type_name: String,
    pub display_name: Option<String>,
    pub parent_id: Option<String>,
    pub catalog_item_id: Option<String>,
}

impl EntitySpec {
    pub fn of_type(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn catalog_item_id(mut self, id: impl Into<String>) -> Self {
        self.catalog_item_id = Some(id.into());
        self
    }
}

impl Entity {
    pub fn new(spec: EntitySpec) -> Arc<Self> {
        let id = spec
            .id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..10].to_string());
        let display_name = spec
            .display_name
            .unwrap_or_else(|| format!("{}:{}", short_type(&spec.type_name), id));
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            id,
            type_name: spec.type_name,
            display_name,
            parent_id: spec.parent_id,
            catalog_item_id: RwLock::new(spec.catalog_item_id),
            effectors: DashMap::new(),
            sensors: DashMap::new(),
            events,
            managed: AtomicBool::new(false),
            feeds: DashMap::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn catalog_item_id(&self) -> Option<String> {
        self.catalog_item_id.read().ok().and_then(|c| c.clone())
    }

    pub fn set_catalog_item_id(&self, id: Option<String>) {
        if let Ok(mut c) = self.catalog_item_id.write() {
            *c = id;
        }
    }

    // --- effectors ---

    /// Registers an effector, replacing any effector already using the name.
    pub fn add_effector(&self, effector: Effector) -> Arc<Effector> {
        let effector = Arc::new(effector);
        if self
            .effectors
            .insert(effector.name().to_string(), effector.clone())
            .is_some()
        {
            debug!(entity_id = %self.id, effector = effector.name(), "Effector overridden");
        }
        effector
    }

    pub fn effector(&self, name: &str) -> Option<Arc<Effector>> {
        self.effectors.get(name).map(|e| e.value().clone())
    }

    pub fn effectors(&self) -> Vec<Arc<Effector>> {
        let mut all: Vec<_> = self.effectors.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    // --- sensors ---

    pub fn sensor(&self, name: &str) -> Option<Value> {
        self.sensors.get(name).map(|v| v.value().clone())
    }

    /// Publishes a sensor value and notifies subscribers. Returns the old value.
    pub fn set_sensor(&self, name: &str, value: Value) -> Option<Value> {
        let old = self.sensors.insert(name.to_string(), value.clone());
        let _ = self.events.send(SensorEvent {
            entity_id: self.id.clone(),
            sensor: name.to_string(),
            value,
        });
        old
    }

    pub fn clear_sensor(&self, name: &str) -> Option<Value> {
        self.sensors.remove(name).map(|(_, v)| v)
    }

    pub fn sensors(&self) -> BTreeMap<String, Value> {
        self.sensors
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SensorEvent> {
        self.events.subscribe()
    }

    /// Sets or clears one key of the `service.problems` map.
    pub fn update_problem(&self, key: &str, problem: Option<String>) {
        let mut problems = match self.sensor(SERVICE_PROBLEMS) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let changed = match problem {
            Some(p) => problems.insert(key.to_string(), Value::String(p.clone())) != Some(Value::String(p)),
            None => problems.remove(key).is_some(),
        };
        if changed {
            self.set_sensor(SERVICE_PROBLEMS, Value::Object(problems));
        }
    }

    // --- management ---

    pub fn is_managed(&self) -> bool {
        self.managed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_managed(&self, managed: bool) {
        self.managed.store(managed, Ordering::SeqCst);
    }

    // --- feeds ---

    /// Attaches a feed. A feed with the same unique tag replaces the existing
    /// one, so re-creating an equivalent feed never duplicates it.
    pub fn add_feed(&self, feed: Arc<Feed>) -> Result<Arc<Feed>> {
        if let Some(old) = self.feeds.insert(feed.unique_tag().to_string(), feed.clone()) {
            if !Arc::ptr_eq(&old, &feed) {
                info!(entity_id = %self.id, feed = feed.unique_tag(), "Replacing feed with same tag");
                old.destroy();
            }
        }
        if self.is_managed() && !feed.is_activated() && !feed.is_destroyed() {
            feed.start()?;
        }
        Ok(feed)
    }

    pub fn feed(&self, tag: &str) -> Option<Arc<Feed>> {
        self.feeds.get(tag).map(|f| f.value().clone())
    }

    pub fn feeds(&self) -> Vec<Arc<Feed>> {
        let mut all: Vec<_> = self.feeds.iter().map(|f| f.value().clone()).collect();
        all.sort_by(|a, b| a.unique_tag().cmp(b.unique_tag()));
        all
    }

    pub fn remove_feed(&self, tag: &str) -> Option<Arc<Feed>> {
        let removed = self.feeds.remove(tag).map(|(_, f)| f);
        if let Some(feed) = &removed {
            feed.destroy();
        }
        removed
    }
}

fn short_type(type_name: &str) -> &str {
    type_name.rsplit('.').next().unwrap_or(type_name)
}

/// 实体注册表 (management context 所有)
#[derive(Default)]
pub struct EntityRegistry {
    entities: DashMap<String, Arc<Entity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entity: Arc<Entity>) -> Result<()> {
        if self.entities.contains_key(entity.id()) {
            return Err(EngineError::IllegalState(format!(
                "Entity {} is already registered",
                entity.id()
            )));
        }
        self.entities.insert(entity.id().to_string(), entity);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Entity>> {
        self.entities.get(id).map(|e| e.value().clone())
    }

    pub fn require(&self, id: &str) -> Result<Arc<Entity>> {
        self.get(id).ok_or_else(|| EngineError::not_found("Entity", id))
    }

    pub fn all(&self) -> Vec<Arc<Entity>> {
        let mut all: Vec<_> = self.entities.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Marks an entity managed and starts its pending feeds. If a feed fails
    /// to start, the feeds started here are stopped and the entity goes back
    /// to unmanaged.
    pub fn manage(&self, entity: &Arc<Entity>) -> Result<()> {
        let newly_registered = !self.entities.contains_key(entity.id());
        if newly_registered {
            self.register(entity.clone())?;
        }
        entity.set_managed(true);
        let mut started = Vec::new();
        for feed in entity.feeds() {
            if feed.is_activated() || feed.is_destroyed() {
                continue;
            }
            match feed.start() {
                Ok(()) => started.push(feed),
                // another caller started it first
                Err(_) if feed.is_activated() => {}
                Err(e) => {
                    warn!(entity_id = %entity.id(), feed = %feed.unique_tag(), "Feed failed to start; entity left unmanaged: {}", e);
                    for feed in started {
                        feed.stop();
                    }
                    entity.set_managed(false);
                    if newly_registered {
                        self.entities.remove(entity.id());
                    }
                    return Err(e);
                }
            }
        }
        info!(entity_id = %entity.id(), "Entity managed");
        Ok(())
    }

    pub fn unmanage(&self, id: &str) -> Option<Arc<Entity>> {
        let (_, entity) = self.entities.remove(id)?;
        entity.set_managed(false);
        for feed in entity.feeds() {
            feed.stop();
        }
        info!(entity_id = %id, "Entity unmanaged");
        Some(entity)
    }

    pub fn clear(&self) {
        for entity in self.all() {
            self.unmanage(entity.id());
        }
    }
}

pub type EntityInitializer =
    Arc<dyn Fn(&ManagementContext, &Arc<Entity>) -> Result<()> + Send + Sync>;

/// 类型解析服务：类型名 → 初始化器（安装效应器、feed）
///
/// Rebind resolves persisted type names through here.
#[derive(Default)]
pub struct EntityTypeRegistry {
    initializers: DashMap<String, EntityInitializer>,
}

impl EntityTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, type_name: impl Into<String>, init: F)
    where
        F: Fn(&ManagementContext, &Arc<Entity>) -> Result<()> + Send + Sync + 'static,
    {
        self.initializers.insert(type_name.into(), Arc::new(init));
    }

    pub fn is_known(&self, type_name: &str) -> bool {
        self.initializers.contains_key(type_name)
    }

    pub fn instantiate(&self, mgmt: &ManagementContext, spec: EntitySpec) -> Result<Arc<Entity>> {
        let init = self
            .initializers
            .get(&spec.type_name)
            .map(|i| i.value().clone());
        let entity = Entity::new(spec);
        match init {
            Some(init) => init(mgmt, &entity)?,
            None => warn!(
                entity_id = %entity.id(),
                type_name = entity.type_name(),
                "Unknown entity type; creating bare entity"
            ),
        }
        Ok(entity)
    }

    pub fn clear(&self) {
        self.initializers.clear();
    }
}
