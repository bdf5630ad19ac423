//! Versioned asset cache for offline support.
//!
//! This module provides:
//! - Named cache generations holding responses keyed by normalized request identity
//! - Cache-first and network-first fetch strategies over the active generation
//! - The install/activate lifecycle that pre-caches the app shell and purges old generations

mod layer;
mod lifecycle;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheSource, CacheStorage, RequestKey};
