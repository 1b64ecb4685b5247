//! Client-side data synchronization for the shopkeep operator dashboard.
//!
//! This crate keeps independent views (chat list, message pane) consistent
//! with a backend whose writes become visible asynchronously and which may be
//! unreachable.
//!
//! ## Features
//!
//! - **Cache**: one entry per query key with deduplicated in-flight fetches
//! - **Fetcher**: JSON-over-HTTP with timeout and fallback values
//! - **Bus**: typed cache events, coalesced per tick
//! - **Poller**: per-key refresh timers that stop with the last subscriber
//! - **Mutations**: optimistic patches, rollback and staggered revalidation
//! - **Fallback**: demo resources served without touching the network
//! - **API**: typed dashboard records and a client wiring it all together

pub mod api;
pub mod binding;
pub mod bus;
pub mod config;
mod entry;
mod error;
pub mod fallback;
mod fetcher;
pub mod handoff;
mod key;
pub mod mutation;
pub mod notice;
pub mod poller;
mod store;

pub use api::{ChatSummary, DashboardClient, DemoDataset, Message, Payload, Sender, chats_key, messages_key};
pub use binding::QueryHandle;
pub use bus::{BusSubscription, CacheEvent, EventHandler, InvalidationBus};
pub use config::{ConfigError, SyncConfig};
pub use entry::{CacheEntry, EntrySnapshot, EntryStatus};
pub use error::{FetchFailure, SyncError};
pub use fallback::{DEFAULT_DEMO_PREFIX, FallbackProvider, FallbackSource, StaticDataset};
pub use fetcher::{FetchOutcome, Fetcher};
pub use handoff::{Handoff, HandoffError};
pub use key::QueryKey;
pub use mutation::{MutationCoordinator, MutationState, OptimisticPatch, optimistic};
pub use notice::{Notice, NoticeBoard, NoticeLevel};
pub use poller::Poller;
pub use store::{CacheStore, LoadResult, Loader, Subscription, loader};
