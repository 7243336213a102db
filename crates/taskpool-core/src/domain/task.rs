//! Pool tasks, claimed tasks and in-progress users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::ids::{ActorId, ClaimedTaskId, ItemId, PoolTaskId};
use super::names::{ActionId, StepId, WorkflowId};
use super::party::Party;

/// The claim opportunity: one action of one step on one item.
///
/// Claiming consumes the opportunity for every party that was offered it, so
/// this is the granularity at which pool tasks are deleted and at which
/// `pool_for` de-duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub item: ItemId,
    pub step: StepId,
    pub action: ActionId,
}

impl TaskKey {
    pub fn new(item: ItemId, step: impl Into<StepId>, action: impl Into<ActionId>) -> Self {
        Self {
            item,
            step: step.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.item, self.step, self.action)
    }
}

/// An unclaimed opportunity addressed to one actor or one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTask {
    pub id: PoolTaskId,
    pub item: ItemId,
    pub workflow: WorkflowId,
    pub step: StepId,
    pub action: ActionId,
    pub party: Party,
    pub created_at: DateTime<Utc>,
}

impl PoolTask {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            item: self.item,
            step: self.step.clone(),
            action: self.action.clone(),
        }
    }

    pub fn matches(&self, key: &TaskKey) -> bool {
        self.item == key.item && self.step == key.step && self.action == key.action
    }
}

/// A task exclusively held by one actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub id: ClaimedTaskId,
    pub item: ItemId,
    pub workflow: WorkflowId,
    pub step: StepId,
    pub action: ActionId,
    pub owner: ActorId,
    pub created_at: DateTime<Utc>,
}

impl ClaimedTask {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            item: self.item,
            step: self.step.clone(),
            action: self.action.clone(),
        }
    }

    pub fn matches(&self, key: &TaskKey) -> bool {
        self.item == key.item && self.step == key.step && self.action == key.action
    }
}

/// "Actor X has begun (and maybe finished) step S of item I."
///
/// One row per (item, step, actor), so counts stay per actor. `actions` keeps
/// every action the actor engaged through in that step; none of them is
/// offered to the actor again through a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressUser {
    pub item: ItemId,
    pub workflow: WorkflowId,
    pub step: StepId,
    pub actions: BTreeSet<ActionId>,
    pub actor: ActorId,
    pub finished: bool,
    pub updated_at: DateTime<Utc>,
}

impl InProgressUser {
    /// Row for an actor's first engagement with a step.
    pub fn engaged(task: &ClaimedTask, now: DateTime<Utc>) -> Self {
        Self {
            item: task.item,
            workflow: task.workflow.clone(),
            step: task.step.clone(),
            actions: BTreeSet::from([task.action.clone()]),
            actor: task.owner,
            finished: false,
            updated_at: now,
        }
    }

    /// Record another engagement; the step is in progress again.
    pub fn engage(&mut self, task: &ClaimedTask, now: DateTime<Utc>) {
        self.workflow = task.workflow.clone();
        self.actions.insert(task.action.clone());
        self.finished = false;
        self.updated_at = now;
    }

    pub fn engaged_in(&self, key: &TaskKey) -> bool {
        self.item == key.item && self.step == key.step && self.actions.contains(&key.action)
    }
}

/// Everything the store holds for one item (audit view).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTasks {
    pub roles: Vec<super::item::WorkflowItemRole>,
    pub pool: Vec<PoolTask>,
    pub claimed: Vec<ClaimedTask>,
    pub in_progress: Vec<InProgressUser>,
}

impl ItemTasks {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
            && self.pool.is_empty()
            && self.claimed.is_empty()
            && self.in_progress.is_empty()
    }
}
