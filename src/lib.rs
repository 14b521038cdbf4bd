//! Local-first sync for the textile wage records: factories (`pabrik`), cost
//! rates (`ongkos`) and employees (`karyawan`), kept in a local working copy
//! and mirrored to a single JSON document in a GitHub repository.

pub mod config;
pub mod engine;
pub mod error;
pub mod github;
pub mod id;
pub mod model;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod validate;

pub use config::{Config, RemoteConfig, SyncPolicy};
pub use engine::{ConflictChoice, Outcome};
pub use error::{RemoteError, StoreError, SyncError};
pub use github::GitHubRemote;
pub use model::{Collection, Kind, Record, RecordId, Snapshot, SyncMetadata};
pub use remote::{MemoryRemote, RemoteStore};
pub use scheduler::Scheduler;
pub use store::LocalStore;
pub use sync::{LogObserver, Phase, PullReport, PushReport, SyncObserver, Syncer};
