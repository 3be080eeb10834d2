//! Raft log and state machine storage.
//!
//! Two log stores: `RedbLogStore` persists entries, vote and committed
//! pointer in a redb database and is what the daemon runs on (an entry is
//! on disk before the callback reports it flushed); `InMemoryLogStore`
//! keeps the same contract in an ordered map for tests and simulations.
//!
//! The state machine owns the two pools. Apply runs one committed entry at
//! a time in log order, synchronously, which is what makes allocation
//! deterministic across replicas: no wall clock, no randomness, and every
//! container in the replicated state iterates in BTree order.
//!
//! Snapshots serialize the complete pool state (every node registration,
//! every subnet's allocation table and its bitmap words), so a replica
//! restored from snapshot continues exactly where full-log replay would
//! have landed. Aggregate statistics are derived, never persisted.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::Stream;
use futures::TryStreamExt;
use openraft::alias::LogIdOf;
use openraft::alias::SnapshotDataOf;
use openraft::alias::VoteOf;
use openraft::entry::RaftEntry;
use openraft::storage::EntryResponder;
use openraft::storage::IOFlushed;
use openraft::storage::RaftLogStorage;
use openraft::storage::RaftSnapshotBuilder;
use openraft::storage::RaftStateMachine;
use openraft::storage::Snapshot;
use openraft::EntryPayload;
use openraft::LogState;
use openraft::OptionalSend;
use openraft::RaftLogReader;
use openraft::StoredMembership;
use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

use crate::error::IpamError;
use crate::pool::{BlockInfo, Pool, PoolStats};
use crate::raft::types::{IpamRequest, IpamResponse, IpamTypeConfig, ResponseData};
use crate::topology::{NodeStatsDetail, TopologyPool, TopologyPoolStats};

// ====================================================================================
// Log storage
// ====================================================================================

/// In-memory Raft log store.
///
/// Entries, vote and committed pointer live in a `BTreeMap` behind an
/// async mutex. Cloning shares the underlying store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLogStore {
    inner: Arc<Mutex<LogStoreInner>>,
}

#[derive(Debug, Default)]
struct LogStoreInner {
    last_purged_log_id: Option<LogIdOf<IpamTypeConfig>>,
    log: BTreeMap<u64, <IpamTypeConfig as openraft::RaftTypeConfig>::Entry>,
    committed: Option<LogIdOf<IpamTypeConfig>>,
    vote: Option<VoteOf<IpamTypeConfig>>,
}

impl LogStoreInner {
    fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Vec<<IpamTypeConfig as openraft::RaftTypeConfig>::Entry>
    where
        RB: RangeBounds<u64> + Clone + Debug,
    {
        self.log.range(range).map(|(_, entry)| entry.clone()).collect()
    }

    fn get_log_state(&mut self) -> LogState<IpamTypeConfig> {
        let last_log_id = self.log.iter().next_back().map(|(_, entry)| entry.log_id());
        let last_purged = self.last_purged_log_id;
        LogState {
            last_purged_log_id: last_purged,
            last_log_id: last_log_id.or(last_purged),
        }
    }

    fn append<I>(&mut self, entries: I, callback: IOFlushed<IpamTypeConfig>)
    where
        I: IntoIterator<Item = <IpamTypeConfig as openraft::RaftTypeConfig>::Entry>,
    {
        for entry in entries {
            self.log.insert(entry.log_id().index(), entry);
        }
        callback.io_completed(Ok(()));
    }

    fn truncate(&mut self, log_id: LogIdOf<IpamTypeConfig>) {
        let keys = self.log.range(log_id.index()..).map(|(k, _)| *k).collect::<Vec<_>>();
        for key in keys {
            self.log.remove(&key);
        }
    }

    fn purge(&mut self, log_id: LogIdOf<IpamTypeConfig>) {
        if let Some(prev) = &self.last_purged_log_id {
            assert!(prev <= &log_id);
        }
        self.last_purged_log_id = Some(log_id);
        let keys = self.log.range(..=log_id.index()).map(|(k, _)| *k).collect::<Vec<_>>();
        for key in keys {
            self.log.remove(&key);
        }
    }
}

impl RaftLogReader<IpamTypeConfig> for InMemoryLogStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<<IpamTypeConfig as openraft::RaftTypeConfig>::Entry>, io::Error>
    where
        RB: RangeBounds<u64> + Clone + Debug + OptionalSend,
    {
        let mut inner = self.inner.lock().await;
        Ok(inner.try_get_log_entries(range))
    }

    async fn read_vote(&mut self) -> Result<Option<VoteOf<IpamTypeConfig>>, io::Error> {
        let inner = self.inner.lock().await;
        Ok(inner.vote)
    }
}

impl RaftLogStorage<IpamTypeConfig> for InMemoryLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<IpamTypeConfig>, io::Error> {
        let mut inner = self.inner.lock().await;
        Ok(inner.get_log_state())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogIdOf<IpamTypeConfig>>,
    ) -> Result<(), io::Error> {
        let mut inner = self.inner.lock().await;
        inner.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogIdOf<IpamTypeConfig>>, io::Error> {
        let inner = self.inner.lock().await;
        Ok(inner.committed)
    }

    async fn save_vote(&mut self, vote: &VoteOf<IpamTypeConfig>) -> Result<(), io::Error> {
        let mut inner = self.inner.lock().await;
        inner.vote = Some(*vote);
        Ok(())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: IOFlushed<IpamTypeConfig>,
    ) -> Result<(), io::Error>
    where
        I: IntoIterator<Item = <IpamTypeConfig as openraft::RaftTypeConfig>::Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut inner = self.inner.lock().await;
        inner.append(entries, callback);
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogIdOf<IpamTypeConfig>) -> Result<(), io::Error> {
        let mut inner = self.inner.lock().await;
        inner.truncate(log_id);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogIdOf<IpamTypeConfig>) -> Result<(), io::Error> {
        let mut inner = self.inner.lock().await;
        inner.purge(log_id);
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

// ====================================================================================
// Redb-backed log store
// ====================================================================================

/// Log entries: key = log index, value = postcard-encoded entry.
const RAFT_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");

/// Log metadata: keys `vote`, `committed`, `last_purged_log_id`.
const RAFT_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

/// Errors from the persistent log store.
#[derive(Debug, Snafu)]
pub enum LogStoreError {
    #[snafu(display("failed to open raft log database at {}: {source}", path.display()))]
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

    #[snafu(display("failed to open raft log table: {source}"))]
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

    #[snafu(display("failed to encode log record: {source}"))]
    Encode { source: postcard::Error },

    #[snafu(display("failed to decode log record: {source}"))]
    Decode { source: postcard::Error },

    #[snafu(display("failed to create {}: {source}", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<LogStoreError> for io::Error {
    fn from(err: LogStoreError) -> Self {
        io::Error::other(err)
    }
}

/// Persistent Raft log backed by redb.
///
/// Entries, vote and committed pointer are committed to disk before the
/// append callback reports the I/O flushed, which is what lets a majority
/// guarantee durability before apply. Cloning shares the database handle.
#[derive(Clone, Debug)]
pub struct RedbLogStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbLogStore {
    /// Create or open the log database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, LogStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu { path: parent })?;
        }

        let db = if path.exists() {
            Database::open(&path).context(OpenDatabaseSnafu { path: &path })?
        } else {
            Database::create(&path).context(OpenDatabaseSnafu { path: &path })?
        };

        let write_txn = db.begin_write().context(TransactionSnafu)?;
        write_txn.open_table(RAFT_LOG_TABLE).context(TableSnafu)?;
        write_txn.open_table(RAFT_META_TABLE).context(TableSnafu)?;
        write_txn.commit().context(CommitSnafu)?;

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_meta<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, LogStoreError> {
        let read_txn = self.db.begin_read().context(TransactionSnafu)?;
        let table = read_txn.open_table(RAFT_META_TABLE).context(TableSnafu)?;
        match table.get(key).context(StorageSnafu)? {
            Some(value) => {
                let data = postcard::from_bytes(value.value()).context(DecodeSnafu)?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    fn write_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), LogStoreError> {
        let bytes = postcard::to_stdvec(value).context(EncodeSnafu)?;
        let write_txn = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = write_txn.open_table(RAFT_META_TABLE).context(TableSnafu)?;
            table.insert(key, bytes.as_slice()).context(StorageSnafu)?;
        }
        write_txn.commit().context(CommitSnafu)?;
        Ok(())
    }

    fn last_log_id(&self) -> Result<Option<LogIdOf<IpamTypeConfig>>, LogStoreError> {
        let read_txn = self.db.begin_read().context(TransactionSnafu)?;
        let table = read_txn.open_table(RAFT_LOG_TABLE).context(TableSnafu)?;
        match table.last().context(StorageSnafu)? {
            Some((_, value)) => {
                let entry: <IpamTypeConfig as openraft::RaftTypeConfig>::Entry =
                    postcard::from_bytes(value.value()).context(DecodeSnafu)?;
                Ok(Some(entry.log_id()))
            }
            None => Ok(None),
        }
    }

    fn remove_range(&self, range: impl RangeBounds<u64>) -> Result<(), LogStoreError> {
        let write_txn = self.db.begin_write().context(TransactionSnafu)?;
        {
            let mut table = write_txn.open_table(RAFT_LOG_TABLE).context(TableSnafu)?;
            let keys: Vec<u64> = table
                .range(range)
                .context(StorageSnafu)?
                .map(|item| {
                    let (key, _) = item.context(StorageSnafu)?;
                    Ok::<_, LogStoreError>(key.value())
                })
                .collect::<Result<Vec<_>, _>>()?;
            for key in keys {
                table.remove(key).context(StorageSnafu)?;
            }
        }
        write_txn.commit().context(CommitSnafu)?;
        Ok(())
    }
}

impl RaftLogReader<IpamTypeConfig> for RedbLogStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<<IpamTypeConfig as openraft::RaftTypeConfig>::Entry>, io::Error>
    where
        RB: RangeBounds<u64> + Clone + Debug + OptionalSend,
    {
        let read_txn = self.db.begin_read().context(TransactionSnafu)?;
        let table = read_txn.open_table(RAFT_LOG_TABLE).context(TableSnafu)?;

        let mut entries = Vec::new();
        for item in table.range(range).context(StorageSnafu)? {
            let (_, value) = item.context(StorageSnafu)?;
            let entry = postcard::from_bytes(value.value())
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn read_vote(&mut self) -> Result<Option<VoteOf<IpamTypeConfig>>, io::Error> {
        Ok(self.read_meta("vote")?)
    }
}

impl RaftLogStorage<IpamTypeConfig> for RedbLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<IpamTypeConfig>, io::Error> {
        let last_purged: Option<LogIdOf<IpamTypeConfig>> = self.read_meta("last_purged_log_id")?;
        let last_log_id = self.last_log_id()?;
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last_log_id.or(last_purged),
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogIdOf<IpamTypeConfig>>,
    ) -> Result<(), io::Error> {
        Ok(self.write_meta("committed", &committed)?)
    }

    async fn read_committed(&mut self) -> Result<Option<LogIdOf<IpamTypeConfig>>, io::Error> {
        Ok(self.read_meta("committed")?.flatten())
    }

    async fn save_vote(&mut self, vote: &VoteOf<IpamTypeConfig>) -> Result<(), io::Error> {
        Ok(self.write_meta("vote", vote)?)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: IOFlushed<IpamTypeConfig>,
    ) -> Result<(), io::Error>
    where
        I: IntoIterator<Item = <IpamTypeConfig as openraft::RaftTypeConfig>::Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let result = (|| -> Result<(), LogStoreError> {
            let write_txn = self.db.begin_write().context(TransactionSnafu)?;
            {
                let mut table = write_txn.open_table(RAFT_LOG_TABLE).context(TableSnafu)?;
                for entry in entries {
                    let bytes = postcard::to_stdvec(&entry).context(EncodeSnafu)?;
                    table
                        .insert(entry.log_id().index(), bytes.as_slice())
                        .context(StorageSnafu)?;
                }
            }
            write_txn.commit().context(CommitSnafu)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                callback.io_completed(Ok(()));
                Ok(())
            }
            Err(err) => {
                let io_err = io::Error::other(err.to_string());
                callback.io_completed(Err(io::Error::other(err)));
                Err(io_err)
            }
        }
    }

    async fn truncate(&mut self, log_id: LogIdOf<IpamTypeConfig>) -> Result<(), io::Error> {
        self.remove_range(log_id.index()..)?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogIdOf<IpamTypeConfig>) -> Result<(), io::Error> {
        self.write_meta("last_purged_log_id", &log_id)?;
        self.remove_range(..=log_id.index())?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

// ====================================================================================
// State machine
// ====================================================================================

/// The replicated pool state: everything a snapshot must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpamState {
    pub flat: Pool,
    pub topology: TopologyPool,
}

impl IpamState {
    pub fn new(flat: Pool) -> Self {
        Self {
            flat,
            topology: TopologyPool::new(),
        }
    }
}

/// Full state machine data, including consensus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateMachineData {
    last_applied_log: Option<openraft::LogId<IpamTypeConfig>>,
    last_membership: StoredMembership<IpamTypeConfig>,
    state: IpamState,
}

/// A point-in-time snapshot held for installation or transfer.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub meta: openraft::SnapshotMeta<IpamTypeConfig>,
    /// JSON-encoded [`IpamState`].
    pub data: Vec<u8>,
}

/// Applies committed IPAM commands to the pools and serves reads.
///
/// The apply path is the only writer; openraft delivers entries one at a
/// time, so the write half of the lock is never contended with itself.
/// Read accessors clone bounded views and never block apply for long.
#[derive(Debug)]
pub struct IpamStateMachine {
    state_machine: RwLock<StateMachineData>,
    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
}

impl IpamStateMachine {
    /// Create a state machine around an empty flat pool. Every replica in
    /// a cluster must boot with the same pool configuration.
    pub fn new(flat: Pool) -> Arc<Self> {
        Arc::new(Self {
            state_machine: RwLock::new(StateMachineData {
                last_applied_log: None,
                last_membership: StoredMembership::default(),
                state: IpamState::new(flat),
            }),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
        })
    }

    /// Apply one command to the pool state.
    ///
    /// Pure with respect to its inputs: identical `state` and `request`
    /// produce the same mutation and the same response everywhere. All
    /// failures are returned as response values; a failed command leaves
    /// the state untouched (pool operations validate before mutating).
    pub fn apply_request(state: &mut IpamState, request: &IpamRequest) -> IpamResponse {
        match Self::try_apply(state, request) {
            Ok(data) => IpamResponse::ok(data),
            Err(err) => IpamResponse::err(&err),
        }
    }

    fn try_apply(state: &mut IpamState, request: &IpamRequest) -> Result<ResponseData, IpamError> {
        match request {
            IpamRequest::AllocateBlock { node_id } => {
                let block = state.flat.allocate_block_for_node(node_id)?;
                Ok(ResponseData::BlockGrant {
                    cidr: block.cidr(),
                    node_id: node_id.clone(),
                    total: block.total(),
                    used: block.used(),
                    available: block.available(),
                })
            }
            IpamRequest::ReleaseBlock { node_id, cidr } => {
                let cidr = parse_block_cidr(cidr)?;
                state.flat.release_block_for_node(node_id, cidr)?;
                Ok(ResponseData::BlockReleased {
                    node_id: node_id.clone(),
                    cidr,
                })
            }
            IpamRequest::InitTopology { config } => {
                state.topology.init_topology(config)?;
                let stats = state.topology.stats();
                Ok(ResponseData::TopologyInitialized {
                    zones: stats.zone_count,
                    pods: stats.pod_count,
                    tors: stats.tor_count,
                    subnets: stats.total_subnets,
                })
            }
            IpamRequest::RegisterNode {
                node_id,
                name,
                tor_id,
                labels,
            } => {
                state
                    .topology
                    .register_node(node_id, name, tor_id, labels.clone())?;
                Ok(ResponseData::NodeRegistered {
                    node_id: node_id.clone(),
                    name: name.clone(),
                    tor_id: tor_id.clone(),
                })
            }
            IpamRequest::AllocateIp {
                node_id,
                purpose,
                meta,
            } => {
                let (ip, cidr) = state.topology.allocate_ip(node_id, purpose, meta)?;
                Ok(ResponseData::IpGrant {
                    ip,
                    cidr,
                    node_id: node_id.clone(),
                    purpose: purpose.clone(),
                })
            }
            IpamRequest::ReleaseIp { node_id, ip } => {
                state.topology.release_ip(node_id, *ip)?;
                Ok(ResponseData::IpReleased {
                    ip: *ip,
                    node_id: node_id.clone(),
                })
            }
            IpamRequest::AddSubnet {
                tor_id,
                cidr,
                purpose,
            } => {
                state.topology.add_subnet_to_tor(tor_id, cidr, purpose)?;
                Ok(ResponseData::SubnetAdded {
                    tor_id: tor_id.clone(),
                    cidr: parse_block_cidr(cidr).expect("validated by add_subnet_to_tor"),
                    purpose: purpose.clone(),
                })
            }
            IpamRequest::AllocateNodeIp { node_id } => {
                let (ip, block) = state.flat.allocate_ip_for_node(node_id)?;
                let gateway =
                    std::net::Ipv4Addr::from(u32::from(block.cidr.network()) + 1);
                Ok(ResponseData::NodeIpGrant {
                    ip,
                    node_id: node_id.clone(),
                    block_cidr: block.cidr,
                    gateway,
                    block_under_pressure: block.under_pressure,
                })
            }
            IpamRequest::ReleaseNodeIp { node_id, ip } => {
                state.flat.release_ip(*ip, node_id)?;
                Ok(ResponseData::NodeIpReleased {
                    ip: *ip,
                    node_id: node_id.clone(),
                })
            }
        }
    }

    // ---- read path -----------------------------------------------------

    /// Flat pool statistics.
    pub async fn flat_stats(&self) -> PoolStats {
        self.state_machine.read().await.state.flat.stats()
    }

    /// Topology pool statistics.
    pub async fn topology_stats(&self) -> TopologyPoolStats {
        self.state_machine.read().await.state.topology.stats()
    }

    /// Blocks assigned to a node in the flat pool.
    pub async fn node_blocks(&self, node_id: &str) -> Result<Vec<BlockInfo>, IpamError> {
        self.state_machine.read().await.state.flat.node_blocks(node_id)
    }

    /// Detailed topology standing of one node.
    pub async fn node_stats(&self, node_id: &str) -> Result<NodeStatsDetail, IpamError> {
        self.state_machine.read().await.state.topology.node_stats(node_id)
    }

    /// Run a closure against a read view of the pool state.
    pub async fn with_state<T>(&self, f: impl FnOnce(&IpamState) -> T) -> T {
        let sm = self.state_machine.read().await;
        f(&sm.state)
    }
}

fn parse_block_cidr(cidr: &str) -> Result<ipnet::Ipv4Net, IpamError> {
    cidr.parse::<ipnet::Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|err| IpamError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: err.to_string(),
        })
}

impl RaftSnapshotBuilder<IpamTypeConfig> for Arc<IpamStateMachine> {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn build_snapshot(&mut self) -> Result<Snapshot<IpamTypeConfig>, io::Error> {
        let state_machine = self.state_machine.read().await;
        let data = serde_json::to_vec(&state_machine.state)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let last_applied_log = state_machine.last_applied_log;
        let last_membership = state_machine.last_membership.clone();
        let mut current_snapshot = self.current_snapshot.write().await;
        drop(state_machine);

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied_log {
            format!("{}-{}-{snapshot_idx}", last.committed_leader_id(), last.index())
        } else {
            format!("--{snapshot_idx}")
        };

        let meta = openraft::SnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };

        *current_snapshot = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Cursor::new(data),
        })
    }
}

impl RaftStateMachine<IpamTypeConfig> for Arc<IpamStateMachine> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<openraft::LogId<IpamTypeConfig>>, StoredMembership<IpamTypeConfig>),
        io::Error,
    > {
        let state_machine = self.state_machine.read().await;
        Ok((state_machine.last_applied_log, state_machine.last_membership.clone()))
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply<Strm>(&mut self, mut entries: Strm) -> Result<(), io::Error>
    where
        Strm: Stream<Item = Result<EntryResponder<IpamTypeConfig>, io::Error>>
            + Unpin
            + OptionalSend,
    {
        let mut sm = self.state_machine.write().await;
        while let Some((entry, responder)) = entries.try_next().await? {
            sm.last_applied_log = Some(entry.log_id);
            let response = match entry.payload {
                EntryPayload::Blank => IpamResponse::default(),
                EntryPayload::Normal(ref request) => {
                    IpamStateMachine::apply_request(&mut sm.state, request)
                }
                EntryPayload::Membership(ref membership) => {
                    sm.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    IpamResponse::default()
                }
            };
            if let Some(responder) = responder {
                responder.send(response);
            }
        }
        Ok(())
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<SnapshotDataOf<IpamTypeConfig>, io::Error> {
        let mut current_snapshot = self.current_snapshot.write().await;
        Ok(match current_snapshot.take() {
            Some(snapshot) => Cursor::new(snapshot.data),
            None => Cursor::new(Vec::new()),
        })
    }

    async fn install_snapshot(
        &mut self,
        meta: &openraft::SnapshotMeta<IpamTypeConfig>,
        mut snapshot: SnapshotDataOf<IpamTypeConfig>,
    ) -> Result<(), io::Error> {
        let mut snapshot_data = Vec::new();
        std::io::copy(&mut snapshot, &mut snapshot_data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let new_state: IpamState = serde_json::from_slice(&snapshot_data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        // Discard current state wholesale; restore is idempotent under
        // replay of the same snapshot.
        let mut sm = self.state_machine.write().await;
        sm.state = new_state;
        sm.last_applied_log = meta.last_log_id;
        sm.last_membership = meta.last_membership.clone();
        drop(sm);

        let mut current_snapshot = self.current_snapshot.write().await;
        *current_snapshot = Some(StoredSnapshot {
            meta: meta.clone(),
            data: snapshot_data,
        });

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<IpamTypeConfig>>, io::Error> {
        let snapshot = self.current_snapshot.read().await;
        Ok(snapshot.as_ref().map(|snap| Snapshot {
            meta: snap.meta.clone(),
            snapshot: Cursor::new(snap.data.clone()),
        }))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }
}
