// # Failover Coordinator
//
// Replica-initiated promotion: verify catch-up, rotate the replication
// lineage, claim the failed primary's slots at a higher epoch, notify
// peers, and take the primary role. Every stage checks the session
// deadline; exceeding it parks the session in FAILED with no ownership
// change published.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::common::NodeId;
use crate::error::{FerriteError, Result};
use crate::replication::{HistoryCell, ReplicationManager, ReplicationRole};

use super::topology::{ClusterTopology, NodeInfo, NodeRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverOption {
    /// Normal: requires the replica to be caught up to the primary tail.
    Default,
    /// Skip the catch-up handshake with an unreachable primary.
    Force,
    /// Skip catch-up and peer agreement entirely.
    Takeover,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStage {
    Begin,
    WaitCatchup,
    RotateId,
    ClaimSlots,
    NotifyPeers,
    Completed,
    Failed,
}

/// Peer notification hook; a networked deployment sends the new config
/// over the cluster bus.
pub trait PeerNotifier: Send + Sync {
    fn publish_promotion(&self, promoted: &NodeInfo, claimed_slots: &[u16]) -> Result<()>;
}

/// No-op notifier for single-process tests and standalone mode.
pub struct SilentNotifier;

impl PeerNotifier for SilentNotifier {
    fn publish_promotion(&self, _promoted: &NodeInfo, _claimed_slots: &[u16]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub deadline: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(600),
        }
    }
}

pub struct FailoverSession {
    option: FailoverOption,
    stage: RwLock<FailoverStage>,
    deadline: Instant,
}

impl FailoverSession {
    pub fn new(option: FailoverOption, config: &FailoverConfig) -> Self {
        Self {
            option,
            stage: RwLock::new(FailoverStage::Begin),
            deadline: Instant::now() + config.deadline,
        }
    }

    pub fn stage(&self) -> FailoverStage {
        *self.stage.read()
    }

    pub fn abort(&self) {
        *self.stage.write() = FailoverStage::Failed;
    }

    fn enter(&self, stage: FailoverStage) -> Result<()> {
        if *self.stage.read() == FailoverStage::Failed {
            return Err(FerriteError::CancellationRequested);
        }
        if Instant::now() > self.deadline {
            *self.stage.write() = FailoverStage::Failed;
            warn!(?stage, "failover deadline exceeded");
            return Err(FerriteError::Replication(
                "failover deadline exceeded".to_string(),
            ));
        }
        *self.stage.write() = stage;
        Ok(())
    }

    /// Run the promotion on this (replica) node.
    ///
    /// `primary_tail` is the last known committed AOF tail of the old
    /// primary; `committed_tail` is this node's own committed tail, which
    /// becomes `replication_offset2` after the rotation.
    pub fn execute(
        &self,
        topology: &ClusterTopology,
        history: &Arc<HistoryCell>,
        replication: &ReplicationManager,
        old_primary: &NodeId,
        primary_tail: Option<u64>,
        committed_tail: u64,
        notifier: &dyn PeerNotifier,
    ) -> Result<Vec<u16>> {
        if self.option == FailoverOption::Abort {
            self.abort();
            return Ok(Vec::new());
        }

        // (1) Catch-up check.
        self.enter(FailoverStage::WaitCatchup)?;
        if self.option == FailoverOption::Default {
            if let Some(primary_tail) = primary_tail {
                let applied = replication.replica_offset().max(committed_tail);
                if applied < primary_tail {
                    *self.stage.write() = FailoverStage::Failed;
                    return Err(FerriteError::Replication(format!(
                        "replica at {applied} behind primary tail {primary_tail}"
                    )));
                }
            }
        }

        // (2) Rotate the lineage: replid2 takes the old id, offset2 the
        // final offset under it.
        self.enter(FailoverStage::RotateId)?;
        history.rotate(committed_tail as i64)?;

        // (3) Claim the dead primary's slots at a higher epoch.
        self.enter(FailoverStage::ClaimSlots)?;
        let epoch = topology.bump_epoch();
        let claimed = topology.claim_slots_from(old_primary, epoch);

        // (4) Notify peers.
        self.enter(FailoverStage::NotifyPeers)?;
        topology.set_local_role(NodeRole::Primary, None);
        let promoted = topology.local_node();
        notifier.publish_promotion(&promoted, &claimed)?;

        // (5) Role switch.
        replication.set_role(ReplicationRole::Primary);
        *self.stage.write() = FailoverStage::Completed;
        info!(
            claimed = claimed.len(),
            epoch,
            old_primary = %old_primary,
            "failover completed"
        );
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationConfig;

    fn node(seed: u8, port: u16, role: NodeRole) -> NodeInfo {
        NodeInfo {
            node_id: format!("{:040x}", seed as u128),
            address: "127.0.0.1".to_string(),
            port,
            role,
            primary_of: None,
            config_epoch: 1,
        }
    }

    fn replica_setup(dir: &std::path::Path) -> (ClusterTopology, Arc<HistoryCell>, ReplicationManager, NodeInfo) {
        let primary = node(1, 7000, NodeRole::Primary);
        let mut replica = node(2, 7001, NodeRole::Replica);
        replica.primary_of = Some(primary.node_id.clone());

        let topology = ClusterTopology::new(replica);
        topology.meet(primary.clone());
        topology.merge_slot_claim(100, &primary.node_id, 2);
        topology.merge_slot_claim(101, &primary.node_id, 2);

        let history = Arc::new(HistoryCell::open(dir.join("cluster")).unwrap());
        let replication = ReplicationManager::new(Arc::clone(&history), ReplicationConfig::default());
        replication.set_role(ReplicationRole::Replica);
        (topology, history, replication, primary)
    }

    #[test]
    fn promotion_rotates_and_claims() {
        let dir = tempfile::tempdir().unwrap();
        let (topology, history, replication, primary) = replica_setup(dir.path());
        let replid_before = history.load().primary_replid.clone();

        let session = FailoverSession::new(FailoverOption::Default, &FailoverConfig::default());
        let claimed = session
            .execute(
                &topology,
                &history,
                &replication,
                &primary.node_id,
                Some(5000),
                5000,
                &SilentNotifier,
            )
            .unwrap();

        assert_eq!(session.stage(), FailoverStage::Completed);
        assert_eq!(claimed, vec![100, 101]);
        assert_eq!(topology.owner_of(100), Some(topology.local_id()));
        assert_eq!(replication.role(), ReplicationRole::Primary);

        let rotated = history.load();
        assert_eq!(rotated.primary_replid2, replid_before);
        assert_ne!(rotated.primary_replid, replid_before);
        assert_eq!(rotated.replication_offset2, 5000);
    }

    #[test]
    fn behind_replica_cannot_promote_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (topology, history, replication, primary) = replica_setup(dir.path());

        let session = FailoverSession::new(FailoverOption::Default, &FailoverConfig::default());
        let err = session
            .execute(
                &topology,
                &history,
                &replication,
                &primary.node_id,
                Some(9000),
                100,
                &SilentNotifier,
            )
            .unwrap_err();
        assert!(matches!(err, FerriteError::Replication(_)));
        assert_eq!(session.stage(), FailoverStage::Failed);
        // No ownership change was published.
        assert_eq!(topology.owner_of(100), Some(primary.node_id));
    }

    #[test]
    fn force_skips_the_catchup_check() {
        let dir = tempfile::tempdir().unwrap();
        let (topology, history, replication, primary) = replica_setup(dir.path());
        let session = FailoverSession::new(FailoverOption::Force, &FailoverConfig::default());
        session
            .execute(
                &topology,
                &history,
                &replication,
                &primary.node_id,
                Some(9000),
                100,
                &SilentNotifier,
            )
            .unwrap();
        assert_eq!(session.stage(), FailoverStage::Completed);
    }

    #[test]
    fn expired_deadline_fails_without_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let (topology, history, replication, primary) = replica_setup(dir.path());
        let session = FailoverSession::new(
            FailoverOption::Default,
            &FailoverConfig {
                deadline: Duration::from_secs(0),
            },
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(session
            .execute(
                &topology,
                &history,
                &replication,
                &primary.node_id,
                Some(100),
                100,
                &SilentNotifier,
            )
            .is_err());
        assert_eq!(session.stage(), FailoverStage::Failed);
        assert_eq!(topology.owner_of(100), Some(primary.node_id));
    }
}
