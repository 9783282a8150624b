//! In-memory session and history store: per-session timelines, A/B forks,
//! prompt history selection, snapshots, the generated-image cache and the
//! eviction sweeper.

pub mod error;
pub mod fork;
pub mod images;
pub mod selector;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod sweeper;

pub use error::StoreError;
pub use fork::{BranchSummary, ForkHandle, ForkSummary};
pub use images::{CachedImage, ImageCache};
pub use selector::{select_history, HistorySelection};
pub use snapshot::{HistorySnapshot, SnapshotMeta, SnapshotRuntime};
pub use store::{
    QueryOutcome, RestCall, SessionLease, SessionStore, SessionSummary, StoreConfig, SweepReport,
};
pub use sweeper::EvictionSweeper;
