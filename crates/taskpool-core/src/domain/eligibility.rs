//! Eligibility rules shared by every store implementation.
//!
//! Stores load the relevant rows inside their own transaction and hand them to
//! these functions, so the in-memory store and the SQL store cannot drift apart
//! on who may see or claim what.

use std::collections::{BTreeMap, BTreeSet};

use super::ids::{ActorId, GroupId};
use super::party::Party;
use super::task::{ClaimedTask, InProgressUser, PoolTask, TaskKey};

/// Is `task` offered to `actor`?
///
/// Direct tasks are always offered. A group task is withheld when the actor
/// already engaged the same (item, step, action) through another path.
pub fn is_offered(
    task: &PoolTask,
    actor: ActorId,
    closure: &BTreeSet<GroupId>,
    progress: &[InProgressUser],
) -> bool {
    match task.party {
        Party::Actor(a) => a == actor,
        Party::Group(g) => {
            closure.contains(&g)
                && !progress
                    .iter()
                    .any(|p| p.actor == actor && p.engaged_in(&task.key()))
        }
    }
}

/// Assemble an actor's pool from candidate rows.
///
/// `candidates` holds the direct rows and the rows of every group in the
/// closure, in any order and possibly with duplicates. The result holds one
/// entry per (item, step, action), ordered by that key. A direct row wins over
/// a group row for the same key.
pub fn assemble_pool(
    actor: ActorId,
    closure: &BTreeSet<GroupId>,
    candidates: impl IntoIterator<Item = PoolTask>,
    progress: &[InProgressUser],
) -> Vec<PoolTask> {
    let mut by_key: BTreeMap<TaskKey, PoolTask> = BTreeMap::new();
    for task in candidates {
        if !is_offered(&task, actor, closure, progress) {
            continue;
        }
        let key = task.key();
        let replace = match by_key.get(&key) {
            None => true,
            Some(existing) => existing.party.is_group() && !task.party.is_group(),
        };
        if replace {
            by_key.insert(key, task);
        }
    }
    by_key.into_values().collect()
}

/// Result of evaluating a claim against the rows currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// The actor already holds this task; nothing to write.
    AlreadyHeld(ClaimedTask),
    /// Grant the claim through this pool task.
    Grant(PoolTask),
    /// The opportunity is gone. `holder` is the current owner, if one exists.
    Lost { holder: Option<ActorId> },
    /// Pool tasks exist but none is offered to this actor.
    NotEligible,
}

/// Decide a claim. `pool` and `claimed` must be the rows for `key` only.
pub fn decide_claim(
    actor: ActorId,
    key: &TaskKey,
    closure: &BTreeSet<GroupId>,
    pool: &[PoolTask],
    claimed: &[ClaimedTask],
    progress: &[InProgressUser],
) -> ClaimDecision {
    if let Some(held) = claimed.iter().find(|c| c.owner == actor && c.matches(key)) {
        return ClaimDecision::AlreadyHeld(held.clone());
    }

    let candidates: Vec<&PoolTask> = pool.iter().filter(|t| t.matches(key)).collect();
    if candidates.is_empty() {
        return ClaimDecision::Lost {
            holder: claimed.iter().find(|c| c.matches(key)).map(|c| c.owner),
        };
    }

    // Direct row wins over a group row for the same key.
    let mut offered: Vec<&PoolTask> = candidates
        .into_iter()
        .filter(|t| is_offered(t, actor, closure, progress))
        .collect();
    offered.sort_by_key(|t| t.party.is_group());
    match offered.first() {
        Some(task) => ClaimDecision::Grant((*task).clone()),
        None => ClaimDecision::NotEligible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionId, ClaimedTaskId, ItemId, PoolTaskId, StepId, WorkflowId};
    use chrono::Utc;

    fn pool(key: &TaskKey, party: Party) -> PoolTask {
        PoolTask {
            id: PoolTaskId::random(),
            item: key.item,
            workflow: WorkflowId::new("wf1"),
            step: key.step.clone(),
            action: key.action.clone(),
            party,
            created_at: Utc::now(),
        }
    }

    fn claimed(key: &TaskKey, owner: ActorId) -> ClaimedTask {
        ClaimedTask {
            id: ClaimedTaskId::random(),
            item: key.item,
            workflow: WorkflowId::new("wf1"),
            step: key.step.clone(),
            action: key.action.clone(),
            owner,
            created_at: Utc::now(),
        }
    }

    fn engaged(key: &TaskKey, actor: ActorId) -> InProgressUser {
        InProgressUser {
            item: key.item,
            workflow: WorkflowId::new("wf1"),
            step: key.step.clone(),
            actions: BTreeSet::from([key.action.clone()]),
            actor,
            finished: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn group_task_reachable_twice_is_listed_once() {
        let alice = ActorId::random();
        let (g1, g2) = (GroupId::random(), GroupId::random());
        let key = TaskKey::new(ItemId::random(), "review", "approve");
        let closure = BTreeSet::from([g1, g2]);

        let result = assemble_pool(
            alice,
            &closure,
            vec![pool(&key, g1.into()), pool(&key, g2.into())],
            &[],
        );

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].key(), key);
    }

    #[test]
    fn direct_task_wins_over_group_task() {
        let alice = ActorId::random();
        let g1 = GroupId::random();
        let key = TaskKey::new(ItemId::random(), "review", "approve");

        let result = assemble_pool(
            alice,
            &BTreeSet::from([g1]),
            vec![pool(&key, g1.into()), pool(&key, alice.into())],
            &[],
        );

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].party, Party::Actor(alice));
    }

    #[test]
    fn engagement_hides_group_task_for_same_action_only() {
        let alice = ActorId::random();
        let g2 = GroupId::random();
        let item = ItemId::random();
        let approve = TaskKey::new(item, "review", "approve");
        let edit = TaskKey::new(item, "review", "edit");
        let progress = vec![engaged(&approve, alice)];

        let result = assemble_pool(
            alice,
            &BTreeSet::from([g2]),
            vec![pool(&approve, g2.into()), pool(&edit, g2.into())],
            &progress,
        );

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].action, ActionId::new("edit"));
    }

    #[test]
    fn every_engaged_action_stays_hidden() {
        let alice = ActorId::random();
        let g = GroupId::random();
        let item = ItemId::random();
        let approve = TaskKey::new(item, "review", "approve");
        let comment = TaskKey::new(item, "review", "comment");
        let mut row = engaged(&approve, alice);
        row.actions.insert(comment.action.clone());

        let result = assemble_pool(
            alice,
            &BTreeSet::from([g]),
            vec![pool(&approve, g.into()), pool(&comment, g.into())],
            &[row],
        );

        assert!(result.is_empty());
    }

    #[test]
    fn engagement_does_not_hide_direct_task() {
        let alice = ActorId::random();
        let key = TaskKey::new(ItemId::random(), "review", "approve");
        let task = pool(&key, alice.into());

        assert!(is_offered(&task, alice, &BTreeSet::new(), &[engaged(&key, alice)]));
    }

    #[test]
    fn claim_decisions() {
        let (alice, bob) = (ActorId::random(), ActorId::random());
        let g = GroupId::random();
        let key = TaskKey::new(ItemId::random(), "review", "approve");
        let closure = BTreeSet::from([g]);
        let rows = vec![pool(&key, g.into())];

        assert!(matches!(
            decide_claim(alice, &key, &closure, &rows, &[], &[]),
            ClaimDecision::Grant(t) if t.party == Party::Group(g)
        ));
        assert_eq!(
            decide_claim(bob, &key, &BTreeSet::new(), &rows, &[], &[]),
            ClaimDecision::NotEligible
        );

        let held = vec![claimed(&key, alice)];
        assert!(matches!(
            decide_claim(alice, &key, &closure, &[], &held, &[]),
            ClaimDecision::AlreadyHeld(c) if c.owner == alice
        ));
        assert_eq!(
            decide_claim(bob, &key, &closure, &[], &held, &[]),
            ClaimDecision::Lost { holder: Some(alice) }
        );
        assert_eq!(
            decide_claim(bob, &key, &closure, &[], &[], &[]),
            ClaimDecision::Lost { holder: None }
        );
    }

    #[test]
    fn claim_prefers_direct_row() {
        let alice = ActorId::random();
        let g = GroupId::random();
        let key = TaskKey::new(ItemId::random(), StepId::new("review"), "approve");
        let rows = vec![pool(&key, g.into()), pool(&key, alice.into())];

        assert!(matches!(
            decide_claim(alice, &key, &BTreeSet::from([g]), &rows, &[], &[]),
            ClaimDecision::Grant(t) if t.party == Party::Actor(alice)
        ));
    }
}
