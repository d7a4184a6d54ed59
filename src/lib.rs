pub mod config;
pub mod duration;
pub mod entity;
pub mod error;
pub mod feed;
pub mod management;
pub mod persistence;
pub mod runtime;
pub mod workflow;

pub use config::EngineConfig;
pub use entity::{Entity, EntitySpec};
pub use error::{EngineError, ErrorKind, Result, TaskError};
pub use management::ManagementContext;
