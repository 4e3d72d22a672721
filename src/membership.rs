//! Cluster membership state exchanged through gossip.
//!
//! A `MemberState` is never mutated in place: every transition returns a new
//! state with the next version. Receivers merge what they hear with
//! `MemberState::merge`, where the higher version wins. Only a member may
//! produce new versions of its own state.

use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Uninitialized,
    Joining,
    Active,
    Leaving,
    Left,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionStatus {
    Unknown,
    Joining,
    Active,
    Leaving,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    pub state: PartitionStatus,
    /// Higher priority members become leader first
    pub priority: u32,
}

impl PartitionState {
    pub fn joining(priority: u32) -> Self {
        Self {
            state: PartitionStatus::Joining,
            priority,
        }
    }

    pub fn active(priority: u32) -> Self {
        Self {
            state: PartitionStatus::Active,
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    #[error("member {member} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        member: u64,
        from: MemberStatus,
        to: MemberStatus,
    },

    #[error("member {member} has two different states with version {version}")]
    ProtocolViolation { member: u64, version: u64 },

    #[error("cannot merge state of member {other} into member {member}")]
    MemberMismatch { member: u64, other: u64 },

    #[error("member {member} received a newer version {version} of its own state")]
    NotOwner { member: u64, version: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    pub member_id: u64,
    pub version: u64,
    /// Milliseconds since the Unix epoch
    pub last_updated: u64,
    pub state: MemberStatus,
    pub partitions: BTreeMap<u32, PartitionState>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MemberState {
    pub fn uninitialized(member_id: u64) -> Self {
        Self {
            member_id,
            version: 0,
            last_updated: now_millis(),
            state: MemberStatus::Uninitialized,
            partitions: BTreeMap::new(),
        }
    }

    fn next_version(&self) -> Self {
        Self {
            version: self.version + 1,
            last_updated: now_millis(),
            ..self.clone()
        }
    }

    fn transition(&self, to: MemberStatus) -> Result<Self, MembershipError> {
        let allowed = match to {
            MemberStatus::Joining => !matches!(self.state, MemberStatus::Leaving | MemberStatus::Left),
            MemberStatus::Active => self.state != MemberStatus::Left,
            MemberStatus::Leaving => self.state != MemberStatus::Left,
            MemberStatus::Left | MemberStatus::Uninitialized => true,
        };
        if !allowed {
            return Err(MembershipError::InvalidTransition {
                member: self.member_id,
                from: self.state,
                to,
            });
        }
        let mut next = self.next_version();
        next.state = to;
        Ok(next)
    }

    pub fn to_joining(&self) -> Result<Self, MembershipError> {
        self.transition(MemberStatus::Joining)
    }

    pub fn to_active(&self) -> Result<Self, MembershipError> {
        self.transition(MemberStatus::Active)
    }

    pub fn to_leaving(&self) -> Result<Self, MembershipError> {
        self.transition(MemberStatus::Leaving)
    }

    pub fn to_left(&self) -> Result<Self, MembershipError> {
        self.transition(MemberStatus::Left)
    }

    pub fn with_partition(&self, partition: u32, state: PartitionState) -> Self {
        let mut next = self.next_version();
        next.partitions.insert(partition, state);
        next
    }

    pub fn without_partition(&self, partition: u32) -> Self {
        let mut next = self.next_version();
        next.partitions.remove(&partition);
        next
    }

    /// Version-wins merge of two states of the same member
    pub fn merge(&self, other: &MemberState) -> Result<MemberState, MembershipError> {
        if self.member_id != other.member_id {
            return Err(MembershipError::MemberMismatch {
                member: self.member_id,
                other: other.member_id,
            });
        }
        if self.version == other.version {
            if self != other {
                return Err(MembershipError::ProtocolViolation {
                    member: self.member_id,
                    version: self.version,
                });
            }
            return Ok(self.clone());
        }
        Ok(if self.version > other.version {
            self.clone()
        } else {
            other.clone()
        })
    }
}

/// This node's view of every member
pub struct MemberRegistry {
    local: u64,
    members: BTreeMap<u64, MemberState>,
    logger: Logger,
}

impl MemberRegistry {
    pub fn new(local: u64, logger: Logger) -> Self {
        let mut members = BTreeMap::new();
        members.insert(local, MemberState::uninitialized(local));
        Self {
            local,
            members,
            logger,
        }
    }

    pub fn local_id(&self) -> u64 {
        self.local
    }

    pub fn local(&self) -> &MemberState {
        // Inserted in `new` and never removed
        &self.members[&self.local]
    }

    pub fn get(&self, member: u64) -> Option<&MemberState> {
        self.members.get(&member)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberState> {
        self.members.values()
    }

    /// Produce the next version of the local state
    pub fn update_local<F>(&mut self, update: F) -> Result<&MemberState, MembershipError>
    where
        F: FnOnce(&MemberState) -> Result<MemberState, MembershipError>,
    {
        let next = update(self.local())?;
        debug!(self.logger, "Local member state updated";
            "version" => next.version, "state" => ?next.state);
        self.members.insert(self.local, next);
        Ok(self.local())
    }

    /// Merge a gossiped state. Returns true if the view changed.
    pub fn merge(&mut self, received: MemberState) -> Result<bool, MembershipError> {
        let member = received.member_id;
        if member == self.local {
            let local = self.local();
            if received.version > local.version {
                return Err(MembershipError::NotOwner {
                    member,
                    version: received.version,
                });
            }
            local.merge(&received)?;
            return Ok(false);
        }

        let merged = match self.members.get(&member) {
            Some(current) => current.merge(&received)?,
            None => received,
        };
        let changed = self.members.get(&member) != Some(&merged);
        if changed {
            debug!(self.logger, "Merged member state";
                "member" => member, "version" => merged.version, "state" => ?merged.state);
            self.members.insert(member, merged);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Discard};

    #[test]
    fn test_transitions_bump_version_and_respect_rules() {
        let state = MemberState::uninitialized(1);
        let joining = state.to_joining().unwrap();
        assert_eq!(joining.version, 1);
        let active = joining.to_active().unwrap();
        let leaving = active.to_leaving().unwrap();

        assert!(matches!(
            leaving.to_joining(),
            Err(MembershipError::InvalidTransition { from: MemberStatus::Leaving, .. })
        ));
        let left = leaving.to_left().unwrap();
        assert!(left.to_joining().is_err());
        assert!(left.to_active().is_err());
        // The original is untouched
        assert_eq!(state.state, MemberStatus::Uninitialized);
    }

    #[test]
    fn test_merge_higher_version_wins_either_way() {
        let older = MemberState::uninitialized(2).to_joining().unwrap();
        let newer = older.with_partition(1, PartitionState::active(3));
        assert_eq!(older.merge(&newer).unwrap(), newer);
        assert_eq!(newer.merge(&older).unwrap(), newer);
    }

    #[test]
    fn test_equal_versions_must_be_equal() {
        let base = MemberState::uninitialized(2);
        let a = base.with_partition(1, PartitionState::active(1));
        let b = base.with_partition(2, PartitionState::active(1));
        assert_eq!(a.version, b.version);
        assert!(matches!(a.merge(&b), Err(MembershipError::ProtocolViolation { member: 2, .. })));
        assert_eq!(a.merge(&a.clone()).unwrap(), a);
    }

    #[test]
    fn test_registry_rejects_foreign_versions_of_local_state() {
        let mut registry = MemberRegistry::new(1, Logger::root(Discard, o!()));
        registry.update_local(|s| s.to_joining()).unwrap();

        let forged = registry.local().to_active().unwrap().to_leaving().unwrap();
        assert!(matches!(registry.merge(forged), Err(MembershipError::NotOwner { member: 1, .. })));

        let remote = MemberState::uninitialized(2).to_joining().unwrap();
        assert!(registry.merge(remote.clone()).unwrap());
        assert!(!registry.merge(remote).unwrap());
        assert_eq!(registry.members().count(), 2);
    }
}
