pub mod bus;
pub mod config;
pub mod fetch;
pub mod link;
pub mod store;
pub mod types;

pub use bus::{
    BlockKind, BlockRequest, BusError, OverlayBus, FETCH_TTL, PORT_RHIZOME_REQUEST,
    PORT_RHIZOME_RESPONSE,
};
pub use config::{ConfigError, FetchConfig, OptionDef, OptionKind, SCHEMA};
pub use fetch::{
    EngineStats, FetchEngine, FetchError, IgnoreCache, QueueStats, RecvWindow, RequestOutcome,
    SlotState, Suggestion, VersionCache, VersionLookup,
};
pub use link::{StreamConnector, StreamLink, TokioConnector};
pub use store::{ImportRecord, MemStore, Store, StoreError};
pub use types::*;
