//! stemdeck - resource cache and stem-separation engine for a multi-stem player
//!
//! Re-exports all modules for use by the binary target.

// Core engine (cache, memory policy, workers)
pub mod core;

// Engine modules
pub mod config;
pub mod context;
pub mod playback;
pub mod playlist;
pub mod resources;
pub mod separation;

// App modules
pub mod cli;
pub mod progress;

// Re-export commonly used types
pub use context::{AppContext, AppEvent, CacheReport};
pub use core::{KeyedCache, MemoryPolicy, ResourceError, Workers};
pub use playlist::{PlaylistIndex, Track};
pub use resources::{AudioManager, ImageManager, LyricsManager};
pub use separation::{JobEvent, JobQueue, SeparationJob};
