use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::persistence::memento::{BrooklynObjectType, MementoDelta, MementoRawData};

/// Memento 存储接口
///
/// A mapping from object id to opaque content, partitioned by object type,
/// plus the plane id. Only one persister writes at a time per plane.
#[async_trait]
pub trait MementoStore: Send + Sync {
    async fn load_raw_data(&self) -> Result<MementoRawData>;

    async fn write(&self, kind: BrooklynObjectType, id: &str, content: &str) -> Result<()>;

    async fn delete(&self, kind: BrooklynObjectType, id: &str) -> Result<()>;

    async fn write_bundle_jar(&self, id: &str, bytes: &[u8]) -> Result<()>;

    async fn delete_bundle_jar(&self, id: &str) -> Result<()>;

    async fn write_plane_id(&self, plane_id: &str) -> Result<()>;

    /// Applies a whole batch. Stores that can commit atomically override this;
    /// the default applies entries in order.
    async fn apply(&self, delta: &MementoDelta) -> Result<()> {
        for (kind, id, content) in &delta.writes {
            self.write(*kind, id, content).await?;
        }
        for (kind, id) in &delta.deletes {
            self.delete(*kind, id).await?;
        }
        for (id, bytes) in &delta.jar_writes {
            self.write_bundle_jar(id, bytes).await?;
        }
        for id in &delta.jar_deletes {
            self.delete_bundle_jar(id).await?;
        }
        if let Some(plane_id) = &delta.plane_id {
            self.write_plane_id(plane_id).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMementoStore {
    data: RwLock<MementoRawData>,
}

impl InMemoryMementoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: MementoRawData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, MementoRawData>> {
        self.data
            .write()
            .map_err(|_| EngineError::IllegalState("Memento store lock poisoned".to_string()))
    }
}

#[async_trait]
impl MementoStore for InMemoryMementoStore {
    async fn load_raw_data(&self) -> Result<MementoRawData> {
        self.data
            .read()
            .map(|d| d.clone())
            .map_err(|_| EngineError::IllegalState("Memento store lock poisoned".to_string()))
    }

    async fn write(&self, kind: BrooklynObjectType, id: &str, content: &str) -> Result<()> {
        self.write_lock()?.put(kind, id, content);
        Ok(())
    }

    async fn delete(&self, kind: BrooklynObjectType, id: &str) -> Result<()> {
        self.write_lock()?.remove(kind, id);
        Ok(())
    }

    async fn write_bundle_jar(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.write_lock()?
            .bundle_jars
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete_bundle_jar(&self, id: &str) -> Result<()> {
        self.write_lock()?.bundle_jars.remove(id);
        Ok(())
    }

    async fn write_plane_id(&self, plane_id: &str) -> Result<()> {
        self.write_lock()?.plane_id = Some(plane_id.to_string());
        Ok(())
    }

    async fn apply(&self, delta: &MementoDelta) -> Result<()> {
        delta.apply(&mut *self.write_lock()?);
        Ok(())
    }
}
