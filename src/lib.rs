pub mod canonical;
pub mod change_tracker;
pub mod config;
pub mod error;
pub mod identity;
pub mod license;
pub mod metadata_store;
pub mod primary_store;
pub mod reconciler;
pub mod scheduler;
pub mod transport;

pub use change_tracker::ChangeTracker;
pub use config::EngineConfig;
pub use error::{Result, SyncError};
pub use identity::DeviceIdentity;
pub use license::LicenseStore;
pub use metadata_store::{ChangeEntry, MetadataStore, Operation};
pub use primary_store::PrimaryStore;
pub use reconciler::{InitialSyncReport, Reconciler, SyncMode};
pub use scheduler::Scheduler;
pub use transport::{SyncTransport, Transport};
