//! Container ↔ IP mapping store.
//!
//! A small redb database owned by the serving node, written best-effort
//! after an allocation commits. It is not replicated state: losing it
//! costs reverse lookups (container id → IP), never addresses. Values are
//! JSON so operators can inspect the database with generic tooling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// Mapping records: key = container id, value = JSON [`IpMapping`].
const MAPPINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ip_mappings");

/// One container's address record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpMapping {
    pub container_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub node_id: String,
    pub ip: String,
    /// Address with prefix, e.g. `10.244.1.5/24`.
    pub cidr: String,
    pub block_cidr: String,
    pub allocated_at: DateTime<Utc>,
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_mappings: usize,
    pub mappings_by_node: BTreeMap<String, usize>,
}

/// Errors from the mapping store.
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("failed to open mapping database at {}: {source}", path.display()))]
    OpenDatabase {
        path: PathBuf,
        #[snafu(source(from(redb::DatabaseError, Box::new)))]
        source: Box<redb::DatabaseError>,
    },

    #[snafu(display("failed to begin transaction: {source}"))]
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    #[snafu(display("failed to open mappings table: {source}"))]
    Table {
        #[snafu(source(from(redb::TableError, Box::new)))]
        source: Box<redb::TableError>,
    },

    #[snafu(display("failed to commit transaction: {source}"))]
    Commit {
        #[snafu(source(from(redb::CommitError, Box::new)))]
        source: Box<redb::CommitError>,
    },

    #[snafu(display("storage operation failed: {source}"))]
    Storage {
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    #[snafu(display("failed to encode mapping for {container_id}: {source}"))]
    Encode {
        container_id: String,
        source: serde_json::Error,
    },

    #[snafu(display("failed to decode mapping record: {source}"))]
    Decode { source: serde_json::Error },
}

/// The store handle. Clone-free; share behind an `Arc`.
#[derive(Debug)]
pub struct MappingStore {
    db: Database,
}

impl MappingStore {
    /// Open (or create) the database at `path` and ensure the table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path).context(OpenDatabaseSnafu { path })?;

        let write_txn = db.begin_write().context(TransactionSnafu)?;
        write_txn.open_table(MAPPINGS_TABLE).context(TableSnafu)?;
        write_txn.commit().context(CommitSnafu)?;

        Ok(Self { db })
    }

    /// Insert or replace the mapping for its container id.
    pub fn save(&self, mapping: &IpMapping) -> Result<(), StoreError> {
        let value = serde_json::to_vec(mapping).context(EncodeSnafu {
            container_id: mapping.container_id.clone(),
        })?;

        let write_txn = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = write_txn.open_table(MAPPINGS_TABLE).context(TableSnafu)?;
            table
                .insert(mapping.container_id.as_str(), value.as_slice())
                .context(StorageSnafu)?;
        }
        write_txn.commit().context(CommitSnafu)?;
        Ok(())
    }

    /// Point lookup by container id.
    pub fn get(&self, container_id: &str) -> Result<Option<IpMapping>, StoreError> {
        let read_txn = self.db.begin_read().context(TransactionSnafu)?;
        let table = read_txn.open_table(MAPPINGS_TABLE).context(TableSnafu)?;
        let Some(guard) = table.get(container_id).context(StorageSnafu)? else {
            return Ok(None);
        };
        let mapping = serde_json::from_slice(guard.value()).context(DecodeSnafu)?;
        Ok(Some(mapping))
    }

    /// Remove a mapping. Returns whether it existed.
    pub fn delete(&self, container_id: &str) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write().context(TransactionSnafu)?;
        let existed = {
            let mut table = write_txn.open_table(MAPPINGS_TABLE).context(TableSnafu)?;
            let removed = table.remove(container_id).context(StorageSnafu)?;
            removed.is_some()
        };
        write_txn.commit().context(CommitSnafu)?;
        Ok(existed)
    }

    /// All mappings, ordered by container id.
    pub fn list(&self) -> Result<Vec<IpMapping>, StoreError> {
        self.scan(|_| true)
    }

    /// Mappings for one node. Full-table scan; the table is small.
    pub fn by_node(&self, node_id: &str) -> Result<Vec<IpMapping>, StoreError> {
        self.scan(|m| m.node_id == node_id)
    }

    /// Reverse lookup by address. Full-table scan.
    pub fn by_ip(&self, ip: &str) -> Result<Option<IpMapping>, StoreError> {
        Ok(self.scan(|m| m.ip == ip)?.into_iter().next())
    }

    /// Remove mappings older than `max_age`. Returns how many were removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = self
            .scan(|m| m.allocated_at < cutoff)?
            .into_iter()
            .map(|m| m.container_id)
            .collect();

        let write_txn = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = write_txn.open_table(MAPPINGS_TABLE).context(TableSnafu)?;
            for container_id in &stale {
                table.remove(container_id.as_str()).context(StorageSnafu)?;
            }
        }
        write_txn.commit().context(CommitSnafu)?;
        Ok(stale.len())
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for mapping in self.list()? {
            stats.total_mappings += 1;
            *stats.mappings_by_node.entry(mapping.node_id).or_default() += 1;
        }
        Ok(stats)
    }

    fn scan(&self, keep: impl Fn(&IpMapping) -> bool) -> Result<Vec<IpMapping>, StoreError> {
        let read_txn = self.db.begin_read().context(TransactionSnafu)?;
        let table = read_txn.open_table(MAPPINGS_TABLE).context(TableSnafu)?;

        let mut mappings = Vec::new();
        for entry in table.iter().context(StorageSnafu)? {
            let (_, value) = entry.context(StorageSnafu)?;
            let mapping: IpMapping = serde_json::from_slice(value.value()).context(DecodeSnafu)?;
            if keep(&mapping) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(container_id: &str, node_id: &str, ip: &str) -> IpMapping {
        IpMapping {
            container_id: container_id.into(),
            pod_name: "web-0".into(),
            pod_namespace: "prod".into(),
            node_id: node_id.into(),
            ip: ip.into(),
            cidr: format!("{ip}/24"),
            block_cidr: "10.244.0.0/24".into(),
            allocated_at: Utc::now(),
        }
    }

    fn temp_store() -> (tempfile::TempDir, MappingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::open(dir.path().join("mappings.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_get_delete_roundtrip() {
        let (_dir, store) = temp_store();
        let m = mapping("ctr-1", "n1", "10.244.0.1");
        store.save(&m).unwrap();

        assert_eq!(store.get("ctr-1").unwrap().unwrap(), m);
        assert!(store.get("ctr-2").unwrap().is_none());

        assert!(store.delete("ctr-1").unwrap());
        assert!(!store.delete("ctr-1").unwrap());
        assert!(store.get("ctr-1").unwrap().is_none());
    }

    #[test]
    fn secondary_lookups_scan_the_table() {
        let (_dir, store) = temp_store();
        store.save(&mapping("ctr-1", "n1", "10.244.0.1")).unwrap();
        store.save(&mapping("ctr-2", "n1", "10.244.0.2")).unwrap();
        store.save(&mapping("ctr-3", "n2", "10.244.1.1")).unwrap();

        assert_eq!(store.by_node("n1").unwrap().len(), 2);
        assert_eq!(store.by_node("n3").unwrap().len(), 0);
        assert_eq!(
            store.by_ip("10.244.1.1").unwrap().unwrap().container_id,
            "ctr-3"
        );
        assert!(store.by_ip("10.9.9.9").unwrap().is_none());
    }

    #[test]
    fn cleanup_removes_only_stale_entries() {
        let (_dir, store) = temp_store();
        let mut old = mapping("ctr-old", "n1", "10.244.0.1");
        old.allocated_at = Utc::now() - Duration::hours(48);
        store.save(&old).unwrap();
        store.save(&mapping("ctr-new", "n1", "10.244.0.2")).unwrap();

        let removed = store.cleanup_stale(Duration::hours(24)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("ctr-old").unwrap().is_none());
        assert!(store.get("ctr-new").unwrap().is_some());
    }

    #[test]
    fn stats_count_per_node() {
        let (_dir, store) = temp_store();
        store.save(&mapping("ctr-1", "n1", "10.244.0.1")).unwrap();
        store.save(&mapping("ctr-2", "n2", "10.244.1.1")).unwrap();
        store.save(&mapping("ctr-3", "n2", "10.244.1.2")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_mappings, 3);
        assert_eq!(stats.mappings_by_node["n2"], 2);
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.redb");
        {
            let store = MappingStore::open(&path).unwrap();
            store.save(&mapping("ctr-1", "n1", "10.244.0.1")).unwrap();
        }
        let store = MappingStore::open(&path).unwrap();
        assert!(store.get("ctr-1").unwrap().is_some());
    }
}
