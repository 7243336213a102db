//! Status - counts for dashboards and the step-transition engine.

use serde::{Deserialize, Serialize};

use crate::domain::{ActorId, GroupId};

pub use crate::ports::PoolCounts;

/// One step of one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub pool_tasks: usize,
    pub claimed_tasks: usize,
    /// Actors engaged and not yet finished.
    pub in_progress: usize,
    pub finished: usize,
}

/// Who currently holds a step: parties of open pool tasks plus claim owners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOwners {
    pub actors: Vec<ActorId>,
    pub groups: Vec<GroupId>,
}
