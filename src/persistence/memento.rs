use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use xmltree::Element;

use crate::entity::{Entity, EntitySpec};
use crate::error::{EngineError, Result};
use crate::feed::Feed;
use crate::feed::source::FeedSpec;
use crate::persistence::xml::{self, XmlBuilder, children_named};
use crate::workflow::context::WorkflowExecutionContext;

/// Kinds of persisted object, in the fixed order every pass iterates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrooklynObjectType {
    Entity,
    Location,
    Policy,
    Enricher,
    Feed,
    CatalogItem,
    ManagedBundle,
}

impl BrooklynObjectType {
    pub const ALL: [BrooklynObjectType; 7] = [
        BrooklynObjectType::Entity,
        BrooklynObjectType::Location,
        BrooklynObjectType::Policy,
        BrooklynObjectType::Enricher,
        BrooklynObjectType::Feed,
        BrooklynObjectType::CatalogItem,
        BrooklynObjectType::ManagedBundle,
    ];

    /// Directory (file store) or hash (redis store) holding this type.
    pub fn dir_name(self) -> &'static str {
        match self {
            BrooklynObjectType::Entity => "entities",
            BrooklynObjectType::Location => "locations",
            BrooklynObjectType::Policy => "policies",
            BrooklynObjectType::Enricher => "enrichers",
            BrooklynObjectType::Feed => "feeds",
            BrooklynObjectType::CatalogItem => "catalog",
            BrooklynObjectType::ManagedBundle => "bundles",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.dir_name() == name)
    }
}

impl fmt::Display for BrooklynObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrooklynObjectType::Entity => "entity",
            BrooklynObjectType::Location => "location",
            BrooklynObjectType::Policy => "policy",
            BrooklynObjectType::Enricher => "enricher",
            BrooklynObjectType::Feed => "feed",
            BrooklynObjectType::CatalogItem => "catalog-item",
            BrooklynObjectType::ManagedBundle => "managed-bundle",
        };
        f.write_str(s)
    }
}

impl FromStr for BrooklynObjectType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.to_string() == s || t.dir_name() == s)
            .ok_or_else(|| EngineError::IllegalArgument(format!("Unknown object type '{}'", s)))
    }
}

/// 原始持久化数据：按类型分组、按 id 索引的不透明文本
///
/// Content is kept exactly as loaded, so loading then re-persisting without a
/// transform writes identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MementoRawData {
    pub plane_id: Option<String>,
    objects: BTreeMap<BrooklynObjectType, BTreeMap<String, String>>,
    /// Bundle archives, keyed by bundle id.
    pub bundle_jars: BTreeMap<String, Vec<u8>>,
    /// Groups this build does not recognise, carried through untouched.
    pub unknown: BTreeMap<String, BTreeMap<String, String>>,
}

impl MementoRawData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plane_id(mut self, plane_id: impl Into<String>) -> Self {
        self.plane_id = Some(plane_id.into());
        self
    }

    pub fn objects(&self, kind: BrooklynObjectType) -> Option<&BTreeMap<String, String>> {
        self.objects.get(&kind)
    }

    pub fn objects_mut(&mut self, kind: BrooklynObjectType) -> &mut BTreeMap<String, String> {
        self.objects.entry(kind).or_default()
    }

    /// Existing group only; never creates an empty one.
    pub(crate) fn group_mut(&mut self, kind: BrooklynObjectType) -> Option<&mut BTreeMap<String, String>> {
        self.objects.get_mut(&kind)
    }

    pub fn get(&self, kind: BrooklynObjectType, id: &str) -> Option<&str> {
        self.objects.get(&kind)?.get(id).map(String::as_str)
    }

    pub fn put(&mut self, kind: BrooklynObjectType, id: impl Into<String>, content: impl Into<String>) {
        self.objects_mut(kind).insert(id.into(), content.into());
    }

    pub fn remove(&mut self, kind: BrooklynObjectType, id: &str) -> Option<String> {
        let group = self.objects.get_mut(&kind)?;
        let removed = group.remove(id);
        if group.is_empty() {
            self.objects.remove(&kind);
        }
        removed
    }

    pub fn ids(&self, kind: BrooklynObjectType) -> Vec<String> {
        self.objects
            .get(&kind)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.objects.values().map(BTreeMap::len).sum::<usize>()
            + self.unknown.values().map(BTreeMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.bundle_jars.is_empty()
    }

    /// The writes and deletions that turn `self` into `target`.
    pub fn delta_to(&self, target: &MementoRawData) -> MementoDelta {
        let mut delta = MementoDelta::default();
        for kind in BrooklynObjectType::ALL {
            let empty = BTreeMap::new();
            let before = self.objects.get(&kind).unwrap_or(&empty);
            let after = target.objects.get(&kind).unwrap_or(&empty);
            for (id, content) in after {
                if before.get(id) != Some(content) {
                    delta.writes.push((kind, id.clone(), content.clone()));
                }
            }
            for id in before.keys().filter(|id| !after.contains_key(*id)) {
                delta.deletes.push((kind, id.clone()));
            }
        }
        for (id, bytes) in &target.bundle_jars {
            if self.bundle_jars.get(id) != Some(bytes) {
                delta.jar_writes.push((id.clone(), bytes.clone()));
            }
        }
        for id in self.bundle_jars.keys() {
            if !target.bundle_jars.contains_key(id) {
                delta.jar_deletes.push(id.clone());
            }
        }
        if target.plane_id.is_some() && target.plane_id != self.plane_id {
            delta.plane_id = target.plane_id.clone();
        }
        delta
    }
}

/// A batch of store mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MementoDelta {
    pub writes: Vec<(BrooklynObjectType, String, String)>,
    pub deletes: Vec<(BrooklynObjectType, String)>,
    pub jar_writes: Vec<(String, Vec<u8>)>,
    pub jar_deletes: Vec<String>,
    pub plane_id: Option<String>,
}

impl MementoDelta {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
            && self.deletes.is_empty()
            && self.jar_writes.is_empty()
            && self.jar_deletes.is_empty()
            && self.plane_id.is_none()
    }

    pub fn apply(&self, raw: &mut MementoRawData) {
        for (kind, id, content) in &self.writes {
            raw.put(*kind, id.clone(), content.clone());
        }
        for (kind, id) in &self.deletes {
            raw.remove(*kind, id);
        }
        for (id, bytes) in &self.jar_writes {
            raw.bundle_jars.insert(id.clone(), bytes.clone());
        }
        for id in &self.jar_deletes {
            raw.bundle_jars.remove(id);
        }
        if let Some(plane_id) = &self.plane_id {
            raw.plane_id = Some(plane_id.clone());
        }
    }
}

// --- entity ---

/// Persisted state of one entity, including its workflow contexts.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMemento {
    pub id: String,
    pub type_name: String,
    pub display_name: String,
    pub parent_id: Option<String>,
    pub catalog_item_id: Option<String>,
    pub managed: bool,
    pub sensors: BTreeMap<String, Value>,
    pub feeds: Vec<String>,
    pub workflows: Vec<WorkflowExecutionContext>,
}

impl EntityMemento {
    pub fn of(entity: &Entity, workflows: Vec<WorkflowExecutionContext>) -> Self {
        Self {
            id: entity.id().to_string(),
            type_name: entity.type_name().to_string(),
            display_name: entity.display_name().to_string(),
            parent_id: entity.parent_id().map(str::to_string),
            catalog_item_id: entity.catalog_item_id(),
            managed: entity.is_managed(),
            sensors: entity.sensors(),
            feeds: entity
                .feeds()
                .iter()
                .map(|f| f.unique_tag().to_string())
                .collect(),
            workflows,
        }
    }

    pub fn to_spec(&self) -> EntitySpec {
        EntitySpec {
            id: Some(self.id.clone()),
            type_name: self.type_name.clone(),
            display_name: Some(self.display_name.clone()),
            parent_id: self.parent_id.clone(),
            catalog_item_id: self.catalog_item_id.clone(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut sensors = XmlBuilder::new("sensors");
        for (name, value) in &self.sensors {
            sensors = sensors.child(
                XmlBuilder::new("sensor")
                    .attr("name", name.clone())
                    .body(serde_json::to_string(value)?)
                    .build(),
            );
        }
        let mut feeds = XmlBuilder::new("feeds");
        for tag in &self.feeds {
            feeds = feeds.text("feed", tag.clone());
        }
        let mut builder = XmlBuilder::new("entity")
            .text("id", self.id.clone())
            .text("type", self.type_name.clone())
            .text("displayName", self.display_name.clone())
            .opt_text("parent", self.parent_id.as_deref())
            .opt_text("catalogItemId", self.catalog_item_id.as_deref())
            .text("managed", self.managed.to_string())
            .child(sensors.build())
            .child(feeds.build());
        if !self.workflows.is_empty() {
            builder = builder.text("workflows", serde_json::to_string(&self.workflows)?);
        }
        xml::render(&builder.build())
    }

    pub fn from_xml(content: &str) -> Result<Self> {
        let root = xml::parse(content)?;
        expect_root(&root, "entity")?;
        let mut sensors = BTreeMap::new();
        if let Some(group) = root.get_child("sensors") {
            for sensor in children_named(group, "sensor") {
                let Some(name) = sensor.attributes.get("name") else {
                    continue;
                };
                let text = sensor.get_text().unwrap_or_default();
                sensors.insert(name.clone(), serde_json::from_str(&text)?);
            }
        }
        let feeds = root
            .get_child("feeds")
            .map(|g| {
                children_named(g, "feed")
                    .filter_map(|f| f.get_text().map(|t| t.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        let workflows = match xml::child_text(&root, "workflows") {
            Some(text) if !text.is_empty() => serde_json::from_str(&text)?,
            _ => Vec::new(),
        };
        Ok(Self {
            id: xml::require_text(&root, "id")?,
            type_name: xml::require_text(&root, "type")?,
            display_name: xml::child_text(&root, "displayName").unwrap_or_default(),
            parent_id: xml::child_text(&root, "parent"),
            catalog_item_id: xml::child_text(&root, "catalogItemId"),
            managed: xml::child_text(&root, "managed").is_some_and(|m| m == "true"),
            sensors,
            feeds,
            workflows,
        })
    }
}

// --- feed ---

/// Persisted configuration and lifecycle flags of one feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMemento {
    pub id: String,
    pub type_name: String,
    pub spec: FeedSpec,
}

impl FeedMemento {
    /// Feed ids are scoped by entity; tags are only unique per entity.
    pub fn id_for(entity_id: &str, unique_tag: &str) -> String {
        format!("{}:{}", entity_id, unique_tag)
    }

    pub fn of(feed: &Feed) -> Self {
        let spec = feed.to_spec();
        let type_name = feed_kind(feed);
        Self {
            id: Self::id_for(&spec.entity_id, &spec.unique_tag),
            type_name,
            spec,
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        let root = XmlBuilder::new("feed")
            .text("id", self.id.clone())
            .text("type", self.type_name.clone())
            .text("entity", self.spec.entity_id.clone())
            .text("uniqueTag", self.spec.unique_tag.clone())
            .text("suspended", self.spec.suspended.to_string())
            .text("spec", serde_json::to_string(&self.spec)?)
            .build();
        xml::render(&root)
    }

    pub fn from_xml(content: &str) -> Result<Self> {
        let root = xml::parse(content)?;
        expect_root(&root, "feed")?;
        let mut spec: FeedSpec = serde_json::from_str(&xml::require_text(&root, "spec")?)?;
        // the flat fields win so that text-level migrations take effect
        if let Some(entity) = xml::child_text(&root, "entity") {
            spec.entity_id = entity;
        }
        if let Some(tag) = xml::child_text(&root, "uniqueTag") {
            spec.unique_tag = tag;
        }
        if let Some(suspended) = xml::child_text(&root, "suspended") {
            spec.suspended = suspended == "true";
        }
        Ok(Self {
            id: xml::require_text(&root, "id")?,
            type_name: xml::child_text(&root, "type").unwrap_or_default(),
            spec,
        })
    }
}

fn feed_kind(feed: &Feed) -> String {
    let mut kinds = feed.polls().iter().map(|p| p.source.kind());
    match kinds.next() {
        Some(first) if kinds.all(|k| k == first) => first.to_string(),
        _ => "Feed".to_string(),
    }
}

fn expect_root(root: &Element, name: &str) -> Result<()> {
    if root.name != name {
        return Err(EngineError::Persistence(anyhow::anyhow!(
            "Expected <{}> memento, found <{}>",
            name,
            root.name
        )));
    }
    Ok(())
}
