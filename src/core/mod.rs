//! Core engine modules - cache, memory policy, workers
//!
//! These modules have no knowledge of tracks or media formats.

pub mod error;
pub mod keyed_cache;
pub mod memory;
pub mod ticker;
pub mod workers;

// Re-exports for convenience
pub use error::ResourceError;
pub use keyed_cache::{CacheStats, KeyedCache, LoadResult};
pub use memory::{MemoryPolicy, MemoryReport, MemorySampler, MemoryTrend, PreloadPlan, ResourceKind};
pub use ticker::IntervalTicker;
pub use workers::{TaskError, TaskHandle, Workers};
