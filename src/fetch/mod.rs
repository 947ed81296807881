//! Bundle fetch scheduling and transport.

pub mod engine;
pub mod http;
pub mod ignore;
pub mod queue;
pub mod version_cache;
pub mod window;

// Re-exports
pub use engine::{
    EngineStats, FetchEngine, FetchError, QueueStats, RequestOutcome, SlotState, Suggestion,
};
pub use ignore::IgnoreCache;
pub use queue::{Candidate, FetchQueue, DEFAULT_PRIORITY, QUEUE_CLASSES};
pub use version_cache::{VersionCache, VersionLookup};
pub use window::{RecvWindow, WINDOW_BLOCKS};
