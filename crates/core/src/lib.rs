pub mod config;
pub mod cover;
pub mod db;
pub mod error;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod volume;
pub mod walker;

pub use crate::config::EngineConfig;
pub use crate::error::{Error, Result};
pub use crate::models::*;
pub use crate::orchestrator::ScanOrchestrator;
pub use crate::volume::{normalize, volume_key, CanonicalPath, VolumeKey};
