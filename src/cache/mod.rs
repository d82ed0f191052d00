//! Tagstash cache engine
//!
//! Persists rendered pages and fetch results behind a pluggable storage
//! backend:
//!
//! - **Entries**: payloads with freshness windows, split into durable
//!   (rendered routes) and ephemeral (data fetches) namespaces
//! - **Tag index**: tag to key mapping, written in coalesced batches to
//!   respect backend write-rate limits
//! - **Generation guard**: wipes durable entries once per deployment change
//! - **Purge notifier**: tells an edge cache which paths and tags went stale
//!
//! Callers use [`CacheHandler`]; the other types are exposed for embedders
//! that assemble the pieces themselves.

pub mod backend;
pub mod codec;
mod config;
pub mod entry;
mod error;
mod generation;
mod handler;
pub mod keys;
mod lock;
mod notifier;
pub mod request_tags;
mod store;
mod tag_index;

pub use backend::{
    BackendError, DiskBackend, MemoryBackend, ObjectStoreBackend, SharedBackend, StorageBackend,
};
pub use codec::{MapValue, Payload, PayloadStream};
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntrySummary, EntryTiming, LookupHints, NewEntry};
pub use error::CacheError;
pub use generation::{GenerationGuard, GenerationMarker, GenerationOutcome};
pub use handler::{CacheHandler, CacheHandlerBuilder, CacheStats};
pub use keys::EntryClass;
pub use notifier::{InvalidationNotifier, PurgeClient, PurgeTarget};
pub use request_tags::TagLedger;
pub use store::EntryStore;
pub use tag_index::{IndexMutation, TagExpirations, TagIndex, TagsMapping};
