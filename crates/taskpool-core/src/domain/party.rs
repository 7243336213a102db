//! Party - タスクやロールの宛先
//!
//! 宛先は「Actor 1 人」か「Group 1 つ」のどちらかです。enum にすることで
//! 「両方」「どちらでもない」行は表現できません。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::ids::{ActorId, GroupId};

/// Exactly one actor or exactly one group.
///
/// Pool tasks and per-item roles store this directly, so a row with both or
/// neither cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Party {
    Actor(ActorId),
    Group(GroupId),
}

impl Party {
    pub fn actor(&self) -> Option<ActorId> {
        match self {
            Party::Actor(actor) => Some(*actor),
            Party::Group(_) => None,
        }
    }

    pub fn group(&self) -> Option<GroupId> {
        match self {
            Party::Group(group) => Some(*group),
            Party::Actor(_) => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Party::Group(_))
    }

    /// Does this party include `actor`, given the actor's group closure?
    pub fn includes(&self, actor: ActorId, closure: &BTreeSet<GroupId>) -> bool {
        match self {
            Party::Actor(a) => *a == actor,
            Party::Group(g) => closure.contains(g),
        }
    }
}

impl From<ActorId> for Party {
    fn from(actor: ActorId) -> Self {
        Party::Actor(actor)
    }
}

impl From<GroupId> for Party {
    fn from(group: GroupId) -> Self {
        Party::Group(group)
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Actor(actor) => actor.fmt(f),
            Party::Group(group) => group.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_party_includes_only_that_actor() {
        let alice = ActorId::random();
        let bob = ActorId::random();
        let party = Party::from(alice);

        assert!(party.includes(alice, &BTreeSet::new()));
        assert!(!party.includes(bob, &BTreeSet::new()));
        assert_eq!(party.actor(), Some(alice));
        assert_eq!(party.group(), None);
    }

    #[test]
    fn group_party_matches_through_closure() {
        let alice = ActorId::random();
        let reviewers = GroupId::random();
        let party = Party::from(reviewers);

        assert!(!party.includes(alice, &BTreeSet::new()));
        assert!(party.includes(alice, &BTreeSet::from([reviewers])));
        assert!(party.is_group());
    }

    #[test]
    fn party_serializes_as_tagged_union() {
        let group = GroupId::random();
        let value = serde_json::to_value(Party::Group(group)).unwrap();
        assert_eq!(value["kind"], "group");
    }
}
