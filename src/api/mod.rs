pub mod cache;
pub mod cached_client;
pub mod client;
pub mod types;

pub use cache::{locations_range_tag, EntityKind, SlotPolicy};
pub use cached_client::{OfflineClient, PendingSummary, SyncRound};
pub use client::{HttpRemote, RemoteApi, RemoteResponse};
