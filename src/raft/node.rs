//! Direct Raft node wrapper.
//!
//! Thin async facade over the OpenRaft core: leadership checks, the
//! proposal path with its timeout, and metrics accessors. There is no actor
//! layer; callers hold an `Arc<RaftNode>` and call methods directly.
//!
//! The proposal timeout cancels only the caller's wait. An entry that has
//! already been accepted by the core keeps replicating and will apply on
//! every replica; retrying a non-idempotent command after a timeout can
//! therefore consume a second address.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::{BasicNode, Raft, RaftMetrics};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::ProposalError;
use crate::raft::storage::IpamStateMachine;
use crate::raft::types::{IpamRequest, IpamResponse, IpamTypeConfig, NodeId};

/// Default wall-clock budget for commit + apply of one proposal.
pub const DEFAULT_PROPOSAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on concurrent in-flight proposals per process.
const MAX_CONCURRENT_PROPOSALS: usize = 1000;

/// A Raft node together with its state machine handle.
pub struct RaftNode {
    raft: Raft<IpamTypeConfig>,
    node_id: NodeId,
    state_machine: Arc<IpamStateMachine>,
    proposal_timeout: Duration,
    semaphore: Arc<Semaphore>,
}

impl RaftNode {
    pub fn new(
        node_id: NodeId,
        raft: Raft<IpamTypeConfig>,
        state_machine: Arc<IpamStateMachine>,
    ) -> Self {
        Self {
            raft,
            node_id,
            state_machine,
            proposal_timeout: DEFAULT_PROPOSAL_TIMEOUT,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_PROPOSALS)),
        }
    }

    pub fn with_proposal_timeout(mut self, timeout: Duration) -> Self {
        self.proposal_timeout = timeout;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn raft(&self) -> &Raft<IpamTypeConfig> {
        &self.raft
    }

    /// Read access to the locally applied pool state. Reads served here
    /// are monotonic on this replica but may trail the leader.
    pub fn state_machine(&self) -> &Arc<IpamStateMachine> {
        &self.state_machine
    }

    /// Bootstrap a cluster from this node with the given voters.
    pub async fn initialize(&self, members: BTreeMap<NodeId, BasicNode>) -> Result<(), ProposalError> {
        self.raft
            .initialize(members)
            .await
            .map_err(|err| ProposalError::ConsensusUnavailable {
                reason: err.to_string(),
            })?;
        info!(node_id = self.node_id, "cluster initialized");
        Ok(())
    }

    /// Last known leader, if any.
    pub fn current_leader(&self) -> Option<NodeId> {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    pub fn metrics(&self) -> RaftMetrics<IpamTypeConfig> {
        self.raft.metrics().borrow().clone()
    }

    /// Submit a command through consensus and wait for its applied result.
    ///
    /// Non-leaders reject immediately with `NotLeader` carrying the
    /// current leader hint. The returned [`IpamResponse`] may still carry
    /// `success: false`: state-machine rejections are values, not
    /// transport errors; use [`Self::propose_applied`] to collapse them.
    pub async fn propose(&self, request: IpamRequest) -> Result<IpamResponse, ProposalError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            ProposalError::ConsensusUnavailable {
                reason: "node is shutting down".into(),
            }
        })?;

        let leader = self.current_leader();
        if leader != Some(self.node_id) {
            return Err(ProposalError::NotLeader {
                leader_hint: leader,
            });
        }

        let timeout_ms = self.proposal_timeout.as_millis() as u64;
        let write = self.raft.client_write(request);
        match tokio::time::timeout(self.proposal_timeout, write).await {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(err)) => {
                warn!(error = %err, "proposal rejected by consensus");
                Err(ProposalError::ConsensusUnavailable {
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                // The wait is cancelled, not the entry: if it was accepted
                // it will still commit and apply on every replica.
                warn!(timeout_ms, "proposal timed out");
                Err(ProposalError::Timeout { timeout_ms })
            }
        }
    }

    /// Like [`Self::propose`], but folds a `success: false` response into
    /// `CommandFailed`.
    pub async fn propose_applied(
        &self,
        request: IpamRequest,
    ) -> Result<IpamResponse, ProposalError> {
        let response = self.propose(request).await?;
        if response.success {
            Ok(response)
        } else {
            Err(ProposalError::CommandFailed {
                reason: response
                    .error
                    .unwrap_or_else(|| "unspecified state machine rejection".into()),
            })
        }
    }

    /// Ask the core to take a snapshot now (log compaction).
    pub async fn trigger_snapshot(&self) -> Result<(), ProposalError> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|err| ProposalError::ConsensusUnavailable {
                reason: err.to_string(),
            })
    }

    /// Stop the consensus core. In-flight proposals resolve with errors.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        if let Err(err) = self.raft.shutdown().await {
            warn!(error = %err, "raft core shutdown reported an error");
        }
        info!(node_id = self.node_id, "raft node stopped");
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
