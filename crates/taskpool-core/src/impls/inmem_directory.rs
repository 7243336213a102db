//! In-memory membership directory with nested groups.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{ActorId, GroupId};
use crate::ports::{DirectoryError, MembershipDirectory};

#[derive(Default)]
struct DirectoryState {
    groups: BTreeSet<GroupId>,
    /// actor -> groups it is a direct member of
    actor_groups: BTreeMap<ActorId, BTreeSet<GroupId>>,
    /// group -> groups it is nested in
    parents: BTreeMap<GroupId, BTreeSet<GroupId>>,
}

impl DirectoryState {
    fn closure(&self, actor: ActorId) -> BTreeSet<GroupId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<GroupId> = self
            .actor_groups
            .get(&actor)
            .into_iter()
            .flatten()
            .copied()
            .collect();

        while let Some(group) = queue.pop_front() {
            if !seen.insert(group) {
                continue;
            }
            if let Some(parents) = self.parents.get(&group) {
                queue.extend(parents.iter().copied());
            }
        }
        seen
    }

    /// `group` and every group nested in it, at any depth.
    fn descendants(&self, group: GroupId) -> BTreeSet<GroupId> {
        let mut seen = BTreeSet::from([group]);
        let mut queue = VecDeque::from([group]);
        while let Some(current) = queue.pop_front() {
            for (child, parents) in &self.parents {
                if parents.contains(&current) && seen.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
        seen
    }
}

/// [`MembershipDirectory`] kept in process memory.
///
/// Groups may nest (a group can be a member of another group); cycles are
/// tolerated. Cloning shares the same directory.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_group(&self, group: GroupId) {
        self.state.write().await.groups.insert(group);
    }

    /// Make `actor` a direct member of `group`, creating the group if needed.
    pub async fn add_member(&self, group: GroupId, actor: ActorId) {
        let mut state = self.state.write().await;
        state.groups.insert(group);
        state.actor_groups.entry(actor).or_default().insert(group);
    }

    /// Returns false when `actor` was not a direct member.
    pub async fn remove_member(&self, group: GroupId, actor: ActorId) -> bool {
        let mut state = self.state.write().await;
        state
            .actor_groups
            .get_mut(&actor)
            .is_some_and(|groups| groups.remove(&group))
    }

    /// Nest `child` inside `parent`: members of `child` become members of `parent`.
    pub async fn add_subgroup(&self, parent: GroupId, child: GroupId) {
        let mut state = self.state.write().await;
        state.groups.insert(parent);
        state.groups.insert(child);
        state.parents.entry(child).or_default().insert(parent);
    }
}

#[async_trait]
impl MembershipDirectory for InMemoryDirectory {
    async fn group_closure(&self, actor: ActorId) -> Result<BTreeSet<GroupId>, DirectoryError> {
        Ok(self.state.read().await.closure(actor))
    }

    async fn all_members(&self, group: GroupId) -> Result<BTreeSet<ActorId>, DirectoryError> {
        let state = self.state.read().await;
        if !state.groups.contains(&group) {
            return Err(DirectoryError::UnknownGroup(group));
        }
        let groups = state.descendants(group);
        Ok(state
            .actor_groups
            .iter()
            .filter(|(_, direct)| !direct.is_disjoint(&groups))
            .map(|(actor, _)| *actor)
            .collect())
    }
}
