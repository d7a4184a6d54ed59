use std::collections::HashMap;

use anyhow::Context as AnyhowContext;
use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::Result;
use crate::persistence::memento::{BrooklynObjectType, MementoDelta, MementoRawData};
use crate::persistence::store::MementoStore;

/// One hash per object type: `<prefix>:memento:<dir>` maps id → content.
/// Bundle archives live in `<prefix>:memento:bundle-jars`.
pub struct RedisMementoStore {
    client: redis::Client,
    prefix: String,
}

impl RedisMementoStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid redis url {}", url))?;
        Ok(Self::new(client, prefix))
    }

    fn type_key(&self, kind: BrooklynObjectType) -> String {
        format!("{}:memento:{}", self.prefix, kind.dir_name())
    }

    fn jar_key(&self) -> String {
        format!("{}:memento:bundle-jars", self.prefix)
    }

    fn plane_key(&self) -> String {
        format!("{}:planeId", self.prefix)
    }

    async fn connection(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to redis")
    }
}

#[async_trait]
impl MementoStore for RedisMementoStore {
    async fn load_raw_data(&self) -> Result<MementoRawData> {
        let mut conn = self.connection().await?;
        let mut raw = MementoRawData::new();
        let plane_id: Option<String> = conn.get(self.plane_key()).await.context("Failed to read plane id")?;
        raw.plane_id = plane_id;
        for kind in BrooklynObjectType::ALL {
            let group: HashMap<String, String> = conn
                .hgetall(self.type_key(kind))
                .await
                .with_context(|| format!("Failed to read {} mementos", kind))?;
            for (id, content) in group {
                raw.put(kind, id, content);
            }
        }
        let jars: HashMap<String, Vec<u8>> = conn
            .hgetall(self.jar_key())
            .await
            .context("Failed to read bundle archives")?;
        raw.bundle_jars.extend(jars);
        Ok(raw)
    }

    async fn write(&self, kind: BrooklynObjectType, id: &str, content: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hset(self.type_key(kind), id, content)
            .await
            .with_context(|| format!("Failed to write {} {}", kind, id))?;
        Ok(())
    }

    async fn delete(&self, kind: BrooklynObjectType, id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hdel(self.type_key(kind), id)
            .await
            .with_context(|| format!("Failed to delete {} {}", kind, id))?;
        Ok(())
    }

    async fn write_bundle_jar(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hset(self.jar_key(), id, bytes)
            .await
            .with_context(|| format!("Failed to write bundle archive {}", id))?;
        Ok(())
    }

    async fn delete_bundle_jar(&self, id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hdel(self.jar_key(), id)
            .await
            .with_context(|| format!("Failed to delete bundle archive {}", id))?;
        Ok(())
    }

    async fn write_plane_id(&self, plane_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .set(self.plane_key(), plane_id)
            .await
            .context("Failed to write plane id")?;
        Ok(())
    }

    /// MULTI/EXEC: either the whole batch lands or none of it.
    async fn apply(&self, delta: &MementoDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (kind, id, content) in &delta.writes {
            pipe.hset(self.type_key(*kind), id, content).ignore();
        }
        for (kind, id) in &delta.deletes {
            pipe.hdel(self.type_key(*kind), id).ignore();
        }
        for (id, bytes) in &delta.jar_writes {
            pipe.hset(self.jar_key(), id, bytes.as_slice()).ignore();
        }
        for id in &delta.jar_deletes {
            pipe.hdel(self.jar_key(), id).ignore();
        }
        if let Some(plane_id) = &delta.plane_id {
            pipe.set(self.plane_key(), plane_id).ignore();
        }
        let mut conn = self.connection().await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("Failed to commit memento batch")?;
        Ok(())
    }
}
