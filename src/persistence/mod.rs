pub mod file_store;
pub mod loader;
pub mod memento;
pub mod persister;
pub mod rebind;
pub mod redis_store;
pub mod store;
pub mod transformer;
mod xml;

use std::sync::Arc;

use crate::config::PersistenceConfig;
use crate::error::Result;

pub use file_store::FileMementoStore;
pub use loader::CompoundTransformerLoader;
pub use memento::{BrooklynObjectType, EntityMemento, FeedMemento, MementoDelta, MementoRawData};
pub use persister::Persister;
pub use rebind::{RebindManager, RebindReport};
pub use redis_store::RedisMementoStore;
pub use store::{InMemoryMementoStore, MementoStore};
pub use transformer::{CompoundTransformer, CompoundTransformerBuilder, RuleSpec};

/// The store named by configuration: a directory wins over redis; neither
/// means persistence is off.
pub fn open_store(config: &PersistenceConfig) -> Result<Option<Arc<dyn MementoStore>>> {
    if let Some(dir) = &config.dir {
        return Ok(Some(Arc::new(FileMementoStore::new(dir.clone()))));
    }
    if let Some(url) = &config.redis_url {
        return Ok(Some(Arc::new(RedisMementoStore::open(url, config.redis_prefix.clone())?)));
    }
    Ok(None)
}
