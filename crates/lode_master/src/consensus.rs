//! Consensus-state snapshots for tablet Raft groups and the replica
//! replacement policies evaluated over them.
//!
//! The master never participates in tablet consensus; it caches the most
//! recently reported committed configuration per tablet and uses its
//! opid index as the compare-and-set token for configuration changes.

use serde::{Deserialize, Serialize};

/// Term assigned to a tablet's consensus state before any leader exists.
pub const MINIMUM_TERM: i64 = 0;

/// Opid index recorded for configurations that have not committed anything.
pub const INVALID_OPID_INDEX: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    Voter,
    NonVoter,
}

/// Health of a peer as tracked by its tablet leader. Runtime-only: never
/// persisted with the tablet record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftPeer {
    pub uuid: String,
    pub member_type: MemberType,
    pub last_known_addr: String,
    /// Promote this non-voter to voter once it has caught up.
    pub promote: bool,
    pub health: Option<HealthStatus>,
}

impl RaftPeer {
    pub fn voter(uuid: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            member_type: MemberType::Voter,
            last_known_addr: addr.into(),
            promote: false,
            health: None,
        }
    }

    fn is_failed(&self) -> bool {
        self.health == Some(HealthStatus::Failed)
    }
}

/// The most recently committed peer set of a tablet's Raft group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Opid index at which this configuration was committed;
    /// [`INVALID_OPID_INDEX`] for the initial configuration assigned by the
    /// master, `None` when a report carries no committed index at all
    /// (tombstoned replicas without consensus metadata).
    pub opid_index: Option<i64>,
    pub peers: Vec<RaftPeer>,
}

impl RaftConfig {
    pub fn opid_index_or_invalid(&self) -> i64 {
        self.opid_index.unwrap_or(INVALID_OPID_INDEX)
    }

    pub fn is_member(&self, uuid: &str) -> bool {
        self.peers.iter().any(|p| p.uuid == uuid)
    }

    pub fn peer(&self, uuid: &str) -> Option<&RaftPeer> {
        self.peers.iter().find(|p| p.uuid == uuid)
    }

    pub fn count_voters(&self) -> usize {
        self.peers.iter().filter(|p| p.member_type == MemberType::Voter).count()
    }

    pub fn member_uuids(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(|p| p.uuid.as_str())
    }
}

/// Consensus state of one tablet as reported by a replica.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub current_term: i64,
    pub leader_uuid: Option<String>,
    pub committed_config: RaftConfig,
    /// Whether a configuration change is in flight on the tablet.
    pub has_pending_config: bool,
}

impl ConsensusState {
    /// Copy with per-peer health reports removed, suitable for persisting.
    pub fn without_health_reports(&self) -> ConsensusState {
        let mut cstate = self.clone();
        for peer in &mut cstate.committed_config.peers {
            peer.health = None;
        }
        cstate
    }

    pub fn leader_is(&self, uuid: &str) -> bool {
        self.leader_uuid.as_deref() == Some(uuid)
    }
}

/// Role a replica plays in a tablet's consensus group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
    Learner,
    NonParticipant,
}

pub fn consensus_role(uuid: &str, cstate: &ConsensusState) -> ReplicaRole {
    match cstate.committed_config.peer(uuid) {
        Some(peer) if cstate.leader_is(uuid) && peer.member_type == MemberType::Voter => {
            ReplicaRole::Leader
        }
        Some(peer) if peer.member_type == MemberType::Voter => ReplicaRole::Follower,
        Some(_) => ReplicaRole::Learner,
        None => ReplicaRole::NonParticipant,
    }
}

/// Whether replacement decisions may assume an unhealthy majority can still
/// commit the resulting configuration change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MajorityHealthPolicy {
    /// Only recommend changes a healthy majority of voters can commit.
    Honor,
    /// Recommend changes regardless of majority health.
    Ignore,
}

fn healthy_voters(config: &RaftConfig) -> usize {
    config
        .peers
        .iter()
        .filter(|p| p.member_type == MemberType::Voter && !p.is_failed())
        .count()
}

fn majority(num_voters: usize) -> usize {
    num_voters / 2 + 1
}

/// Whether the configuration is under-replicated and a new replica should be
/// added. Counts only voters that are not known to have failed.
pub fn should_add_replica(
    config: &RaftConfig,
    replication_factor: i32,
    policy: MajorityHealthPolicy,
) -> bool {
    let healthy = healthy_voters(config);
    if healthy >= replication_factor.max(0) as usize {
        return false;
    }
    match policy {
        MajorityHealthPolicy::Ignore => true,
        // A config change can only commit if a majority of the current
        // voters is alive.
        MajorityHealthPolicy::Honor => healthy >= majority(config.count_voters()),
    }
}

/// Pick a replica to evict from the configuration, if any. Eviction
/// priority: failed non-voters, failed voters, excess non-voters, excess
/// voters. The leader is never evicted.
pub fn should_evict_replica(
    config: &RaftConfig,
    leader_uuid: &str,
    replication_factor: i32,
    policy: MajorityHealthPolicy,
) -> Option<String> {
    let rf = replication_factor.max(0) as usize;
    let healthy = healthy_voters(config);
    let voters = config.count_voters();
    let can_commit = match policy {
        MajorityHealthPolicy::Ignore => true,
        MajorityHealthPolicy::Honor => healthy >= majority(voters),
    };

    // Failed non-voters carry no data worth keeping and are safe to drop.
    if let Some(peer) = config
        .peers
        .iter()
        .find(|p| p.member_type == MemberType::NonVoter && p.is_failed())
    {
        return Some(peer.uuid.clone());
    }

    if !can_commit {
        return None;
    }

    // A failed voter is evicted as soon as the remaining voters can still
    // commit; a replacement is added separately by the add policy.
    if let Some(peer) = config
        .peers
        .iter()
        .find(|p| p.member_type == MemberType::Voter && p.is_failed() && p.uuid != leader_uuid)
    {
        return Some(peer.uuid.clone());
    }

    // With a full healthy voter set, leftover non-voters are no longer
    // needed as replacements.
    if healthy >= rf {
        if let Some(peer) = config
            .peers
            .iter()
            .find(|p| p.member_type == MemberType::NonVoter)
        {
            return Some(peer.uuid.clone());
        }
    }

    // More voters than the replication factor calls for: shed one.
    if voters > rf {
        if let Some(peer) = config
            .peers
            .iter()
            .rev()
            .find(|p| p.member_type == MemberType::Voter && !p.is_failed() && p.uuid != leader_uuid)
        {
            return Some(peer.uuid.clone());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uuid: &str, member_type: MemberType, health: Option<HealthStatus>) -> RaftPeer {
        RaftPeer {
            uuid: uuid.to_string(),
            member_type,
            last_known_addr: format!("{uuid}:7050"),
            promote: false,
            health,
        }
    }

    fn config(peers: Vec<RaftPeer>, opid_index: i64) -> RaftConfig {
        RaftConfig { opid_index: Some(opid_index), peers }
    }

    #[test]
    fn roles_follow_membership_and_leadership() {
        let cstate = ConsensusState {
            current_term: 3,
            leader_uuid: Some("a".to_string()),
            committed_config: config(
                vec![
                    peer("a", MemberType::Voter, None),
                    peer("b", MemberType::Voter, None),
                    peer("c", MemberType::NonVoter, None),
                ],
                5,
            ),
            has_pending_config: false,
        };
        assert_eq!(consensus_role("a", &cstate), ReplicaRole::Leader);
        assert_eq!(consensus_role("b", &cstate), ReplicaRole::Follower);
        assert_eq!(consensus_role("c", &cstate), ReplicaRole::Learner);
        assert_eq!(consensus_role("d", &cstate), ReplicaRole::NonParticipant);
    }

    #[test]
    fn add_replica_honors_majority_health() {
        let under = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("c", MemberType::Voter, Some(HealthStatus::Failed)),
            ],
            5,
        );
        assert!(should_add_replica(&under, 3, MajorityHealthPolicy::Honor));

        let minority = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Failed)),
                peer("c", MemberType::Voter, Some(HealthStatus::Failed)),
            ],
            5,
        );
        assert!(!should_add_replica(&minority, 3, MajorityHealthPolicy::Honor));
        assert!(should_add_replica(&minority, 3, MajorityHealthPolicy::Ignore));

        let full = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("c", MemberType::Voter, Some(HealthStatus::Healthy)),
            ],
            5,
        );
        assert!(!should_add_replica(&full, 3, MajorityHealthPolicy::Honor));
    }

    #[test]
    fn evict_prefers_failed_replicas_and_spares_leader() {
        // One failed voter, majority healthy: the failed voter goes.
        let cfg = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Failed)),
                peer("c", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("d", MemberType::Voter, Some(HealthStatus::Healthy)),
            ],
            7,
        );
        assert_eq!(
            should_evict_replica(&cfg, "a", 3, MajorityHealthPolicy::Honor),
            Some("b".to_string())
        );

        // Only a minority healthy: nothing can commit, nothing is evicted.
        let stuck = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Failed)),
                peer("c", MemberType::Voter, Some(HealthStatus::Failed)),
            ],
            7,
        );
        assert_eq!(should_evict_replica(&stuck, "a", 3, MajorityHealthPolicy::Honor), None);

        // A failed non-voter is evicted even without a commitable majority.
        let failed_learner = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Failed)),
                peer("c", MemberType::Voter, Some(HealthStatus::Failed)),
                peer("d", MemberType::NonVoter, Some(HealthStatus::Failed)),
            ],
            7,
        );
        assert_eq!(
            should_evict_replica(&failed_learner, "a", 3, MajorityHealthPolicy::Honor),
            Some("d".to_string())
        );

        // An intact config of exactly rf healthy voters stays untouched.
        let steady = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("c", MemberType::Voter, Some(HealthStatus::Healthy)),
            ],
            7,
        );
        assert_eq!(should_evict_replica(&steady, "a", 3, MajorityHealthPolicy::Honor), None);
    }

    #[test]
    fn evict_sheds_excess_replicas() {
        let extra_voter = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("c", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("d", MemberType::Voter, Some(HealthStatus::Healthy)),
            ],
            7,
        );
        assert_eq!(
            should_evict_replica(&extra_voter, "a", 3, MajorityHealthPolicy::Honor),
            Some("d".to_string())
        );

        let leftover_learner = config(
            vec![
                peer("a", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("b", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("c", MemberType::Voter, Some(HealthStatus::Healthy)),
                peer("d", MemberType::NonVoter, Some(HealthStatus::Healthy)),
            ],
            7,
        );
        assert_eq!(
            should_evict_replica(&leftover_learner, "a", 3, MajorityHealthPolicy::Honor),
            Some("d".to_string())
        );
    }

    #[test]
    fn health_strip_clears_all_reports() {
        let mut cstate = ConsensusState::default();
        cstate.committed_config = config(
            vec![peer("a", MemberType::Voter, Some(HealthStatus::Healthy))],
            1,
        );
        let stripped = cstate.without_health_reports();
        assert!(stripped.committed_config.peers.iter().all(|p| p.health.is_none()));
        // The original keeps its runtime-only reports.
        assert!(cstate.committed_config.peers[0].health.is_some());
    }
}
