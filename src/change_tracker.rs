//! Change tracker: records every local mutation of the primary store as a
//! `ChangeEntry` (spec §4.4). A thin façade over the metadata store's
//! change-log table, kept as its own component so callers depend on a
//! narrow interface instead of the whole metadata store.

use crate::error::Result;
use crate::metadata_store::{ChangeEntry, MetadataStore, Operation};

pub struct ChangeTracker<'a> {
    store: &'a MetadataStore,
}

impl<'a> ChangeTracker<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        Self { store }
    }

    /// Record a local mutation. Fails only with a store-unavailable style
    /// error; never drops an entry silently.
    pub fn track(
        &self,
        table: &str,
        record_id: &str,
        op: Operation,
        payload: Option<&serde_json::Value>,
    ) -> Result<i64> {
        self.store.track_change(table, record_id, op, payload)
    }

    /// The oldest `limit` unsynced entries, in `seq` order — a
    /// read-consistent snapshot.
    pub fn pending(&self, limit: i64) -> Result<Vec<ChangeEntry>> {
        self.store.pending(limit)
    }

    /// Mark every listed entry as synced under `sync_id`, atomically.
    pub fn mark_synced(&self, entries: &[ChangeEntry], sync_id: &str) -> Result<()> {
        self.store.mark_synced(entries, sync_id)
    }

    pub fn has_unsynced_change(&self, table: &str, record_id: &str) -> Result<bool> {
        self.store.has_unsynced_change(table, record_id)
    }
}
