use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entity::Entity;
use crate::error::Result;
use crate::management::ManagementContext;
use crate::persistence::memento::{
    BrooklynObjectType, EntityMemento, FeedMemento, MementoDelta, MementoRawData,
};
use crate::persistence::store::MementoStore;
use crate::workflow::context::WorkflowExecutionContext;
use crate::workflow::store::WorkflowCheckpointSink;

/// 持久化器：把活动状态写入 memento 存储
///
/// Only entity and feed groups are owned by the persister; every other group
/// found in the store (catalog items, bundles, unknown types) is left as is.
/// Writes are serialized through one lock, so at most one batch is in flight.
pub struct Persister {
    mgmt: ManagementContext,
    store: Arc<dyn MementoStore>,
    last_written: tokio::sync::Mutex<Option<MementoRawData>>,
    periodic: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Persister {
    pub fn new(mgmt: ManagementContext, store: Arc<dyn MementoStore>) -> Arc<Self> {
        Arc::new(Self {
            mgmt,
            store,
            last_written: tokio::sync::Mutex::new(None),
            periodic: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn MementoStore> {
        &self.store
    }

    fn entity_xml(&self, entity: &Entity) -> Result<String> {
        let workflows = self.mgmt.workflows().for_entity(entity.id());
        EntityMemento::of(entity, workflows).to_xml()
    }

    fn put_entity(&self, raw: &mut MementoRawData, entity: &Entity) -> Result<()> {
        raw.put(BrooklynObjectType::Entity, entity.id(), self.entity_xml(entity)?);
        for feed in entity.feeds() {
            let memento = FeedMemento::of(&feed);
            raw.put(BrooklynObjectType::Feed, memento.id.clone(), memento.to_xml()?);
        }
        Ok(())
    }

    /// Live state rendered as mementos.
    pub fn snapshot(&self) -> Result<MementoRawData> {
        let mut raw = MementoRawData::new().with_plane_id(self.mgmt.plane_id());
        for entity in self.mgmt.entities().all() {
            self.put_entity(&mut raw, &entity)?;
        }
        Ok(raw)
    }

    async fn baseline(&self, cached: &Option<MementoRawData>) -> Result<MementoRawData> {
        match cached {
            Some(raw) => Ok(raw.clone()),
            None => self.store.load_raw_data().await,
        }
    }

    /// Writes everything that changed since the last checkpoint and deletes
    /// entities and feeds that are no longer live.
    pub async fn checkpoint(&self) -> Result<MementoDelta> {
        let mut cached = self.last_written.lock().await;
        let baseline = self.baseline(&cached).await?;
        let live = self.snapshot()?;

        let mut target = baseline.clone();
        target.plane_id = live.plane_id.clone();
        for kind in [BrooklynObjectType::Entity, BrooklynObjectType::Feed] {
            for id in baseline.ids(kind) {
                if live.get(kind, &id).is_none() {
                    target.remove(kind, &id);
                }
            }
            if let Some(group) = live.objects(kind) {
                for (id, content) in group {
                    target.put(kind, id.clone(), content.clone());
                }
            }
        }

        let delta = baseline.delta_to(&target);
        if !delta.is_empty() {
            self.store.apply(&delta).await?;
            debug!(
                written = delta.writes.len(),
                deleted = delta.deletes.len(),
                "Checkpoint persisted"
            );
        }
        *cached = Some(target);
        Ok(delta)
    }

    /// Persists a single entity (and its feeds) right away.
    pub async fn persist_entity(&self, entity_id: &str) -> Result<()> {
        let Some(entity) = self.mgmt.entities().get(entity_id) else {
            debug!(entity_id, "Entity no longer registered; skipping persist");
            return Ok(());
        };
        let mut cached = self.last_written.lock().await;
        let baseline = self.baseline(&cached).await?;
        let mut target = baseline.clone();
        self.put_entity(&mut target, &entity)?;
        let delta = baseline.delta_to(&target);
        if !delta.is_empty() {
            self.store.apply(&delta).await?;
        }
        *cached = Some(target);
        Ok(())
    }

    /// Installs the workflow sink and starts the periodic checkpoint loop.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut slot) = self.periodic.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        self.mgmt.workflows().set_sink(self.clone());
        let token = CancellationToken::new();
        let period = self.mgmt.config().persistence_period();
        let this = self.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = this.checkpoint().await {
                    warn!("Periodic persistence failed: {}", e);
                }
            }
        });
        info!(period_ms = period.as_millis() as u64, "Persister started");
        *slot = Some((token, handle));
    }

    /// Stops the loop, writes a final checkpoint and detaches from the workflow store.
    pub async fn stop(&self) -> Result<()> {
        let running = self.periodic.lock().ok().and_then(|mut s| s.take());
        if let Some((token, handle)) = running {
            token.cancel();
            let _ = handle.await;
        }
        self.mgmt.workflows().clear_sink();
        self.checkpoint().await?;
        info!("Persister stopped");
        Ok(())
    }
}

#[async_trait]
impl WorkflowCheckpointSink for Persister {
    async fn workflow_updated(
        &self,
        _mgmt: &ManagementContext,
        workflow: &WorkflowExecutionContext,
    ) -> Result<()> {
        self.persist_entity(&workflow.entity_id).await
    }
}
