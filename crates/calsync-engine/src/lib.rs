//! Calendar sync orchestration.
//!
//! This crate turns the provider adapters into a running sync system:
//!
//! - [`SyncEngine`] - the orchestrator: per-subscription locked syncs with
//!   incremental cursors, full-query fallback, and failure backoff
//! - [`store`] - the persistence contracts the engine runs against, with
//!   in-memory implementations in [`memory`]
//! - [`linking`] - CalDAV and Google account linking flows
//! - [`workspace`] - composed reads over workspace calendars
//! - [`backoff`] / [`channels`] - failure backoff and push-channel upkeep
//!
//! The engine owns no storage and no HTTP server; the embedding service
//! implements the store traits and routes webhook deliveries to
//! [`SyncEngine::sync_subscription`].

pub mod backoff;
pub mod channels;
pub mod error;
pub mod linking;
pub mod lock;
pub mod memory;
pub mod store;
pub mod sync;
pub mod workspace;

pub use backoff::{next_scheduled_sync_deadline, BackoffState, BackoffTracker};
pub use error::{EngineError, EngineResult};
pub use linking::CalDavLinkRequest;
pub use lock::{LockGuard, LockManager, MemoryLockManager};
pub use store::{
    AccountStore, CacheStore, EventStore, StoreError, StoreResult, SubscriptionStore,
    WorkspaceStore,
};
pub use sync::{EngineStores, SyncEngine, SyncOutcome};
pub use workspace::{WorkspaceEventGroup, WorkspaceEvents};
