//! In-memory task store.
//!
//! All tables live behind one async mutex, so every write is trivially
//! serialised and every claim sees a consistent snapshot. Good for tests, demos
//! and single-process deployments; state is lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    ActorId, ClaimDecision, ClaimedTask, ClaimedTaskId, CollectionId, CollectionRole,
    InProgressUser, ItemId, Party, PoolTask, PoolTaskId, RoleId, StepId, TaskKey, WorkflowItem,
    WorkflowItemRole, decide_claim,
};
use crate::ports::{
    ClaimOutcome, ClaimRequest, Cleanup, PoolCounts, ProgressCount, StoreError, StoreResult,
    TaskStore,
};

type ProgressKey = (ItemId, StepId, ActorId);

/// Tables of the in-memory store.
#[derive(Default)]
struct InMemoryState {
    items: HashMap<ItemId, WorkflowItem>,
    collection_roles: BTreeMap<(CollectionId, RoleId), CollectionRole>,
    item_roles: Vec<WorkflowItemRole>,
    pool: BTreeMap<PoolTaskId, PoolTask>,
    claimed: BTreeMap<ClaimedTaskId, ClaimedTask>,
    progress: BTreeMap<ProgressKey, InProgressUser>,
}

impl InMemoryState {
    fn require_item(&self, item: ItemId) -> StoreResult<()> {
        if self.items.contains_key(&item) {
            Ok(())
        } else {
            Err(StoreError::ItemMissing(item))
        }
    }

    /// Upsert the (item, step, actor) row with finished = false and add the
    /// task's action to it.
    fn engage(&mut self, task: &ClaimedTask, now: DateTime<Utc>) {
        self.progress
            .entry((task.item, task.step.clone(), task.owner))
            .and_modify(|row| row.engage(task, now))
            .or_insert_with(|| InProgressUser::engaged(task, now));
    }

    fn pool_for_key(&self, key: &TaskKey) -> Vec<PoolTask> {
        self.pool
            .values()
            .filter(|t| t.matches(key))
            .cloned()
            .collect()
    }

    fn claimed_for_key(&self, key: &TaskKey) -> Vec<ClaimedTask> {
        self.claimed
            .values()
            .filter(|c| c.matches(key))
            .cloned()
            .collect()
    }

    fn progress_of_actor(&self, actor: ActorId) -> Vec<InProgressUser> {
        self.progress
            .values()
            .filter(|p| p.actor == actor)
            .cloned()
            .collect()
    }

    fn claim(&mut self, request: ClaimRequest) -> StoreResult<ClaimOutcome> {
        self.require_item(request.key.item)?;

        let pool = self.pool_for_key(&request.key);
        let claimed = self.claimed_for_key(&request.key);
        let progress = self.progress_of_actor(request.actor);

        let decision = decide_claim(
            request.actor,
            &request.key,
            &request.closure,
            &pool,
            &claimed,
            &progress,
        );
        let granted = match decision {
            ClaimDecision::AlreadyHeld(task) => return Ok(ClaimOutcome::AlreadyHeld(task)),
            ClaimDecision::Lost { holder } => return Ok(ClaimOutcome::Lost { holder }),
            ClaimDecision::NotEligible => return Ok(ClaimOutcome::NotEligible),
            ClaimDecision::Grant(task) => task,
        };

        let task = ClaimedTask {
            id: request.claim_id,
            item: granted.item,
            workflow: granted.workflow,
            step: granted.step,
            action: granted.action,
            owner: request.actor,
            created_at: request.now,
        };
        let before = self.pool.len();
        self.pool.retain(|_, t| !t.matches(&request.key));
        let released = before - self.pool.len();
        self.claimed.insert(task.id, task.clone());
        self.engage(&task, request.now);

        Ok(ClaimOutcome::Claimed { task, released })
    }

    fn close_step(&mut self, item: ItemId, step: &StepId) -> Cleanup {
        let pool_before = self.pool.len();
        self.pool
            .retain(|_, t| !(t.item == item && &t.step == step));
        let claimed_before = self.claimed.len();
        self.claimed
            .retain(|_, c| !(c.item == item && &c.step == step));
        let progress_before = self.progress.len();
        self.progress.retain(|_, p| p.item != item);

        Cleanup {
            roles: 0,
            pool: pool_before - self.pool.len(),
            claimed: claimed_before - self.claimed.len(),
            in_progress: progress_before - self.progress.len(),
        }
    }

    fn unwrap_item(&mut self, item: ItemId) -> StoreResult<(WorkflowItem, Cleanup)> {
        let record = self
            .items
            .remove(&item)
            .ok_or(StoreError::ItemMissing(item))?;

        let roles_before = self.item_roles.len();
        self.item_roles.retain(|r| r.item != item);
        let pool_before = self.pool.len();
        self.pool.retain(|_, t| t.item != item);
        let claimed_before = self.claimed.len();
        self.claimed.retain(|_, c| c.item != item);
        let progress_before = self.progress.len();
        self.progress.retain(|_, p| p.item != item);

        let cleanup = Cleanup {
            roles: roles_before - self.item_roles.len(),
            pool: pool_before - self.pool.len(),
            claimed: claimed_before - self.claimed.len(),
            in_progress: progress_before - self.progress.len(),
        };
        Ok((record, cleanup))
    }
}

/// In-memory [`TaskStore`].
///
/// Cloning shares the same tables, which is how several service instances in
/// one process are pointed at one "database".
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_item(&self, item: WorkflowItem) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.items.contains_key(&item.id) {
            return Err(StoreError::DuplicateItem(item.id));
        }
        state.items.insert(item.id, item);
        Ok(())
    }

    async fn get_item(&self, item: ItemId) -> StoreResult<Option<WorkflowItem>> {
        let state = self.state.lock().await;
        Ok(state.items.get(&item).cloned())
    }

    async fn put_collection_role(
        &self,
        role: CollectionRole,
    ) -> StoreResult<Option<CollectionRole>> {
        let mut state = self.state.lock().await;
        Ok(state
            .collection_roles
            .insert((role.collection, role.role.clone()), role))
    }

    async fn delete_collection_role(
        &self,
        collection: CollectionId,
        role: &RoleId,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .collection_roles
            .remove(&(collection, role.clone()))
            .is_some())
    }

    async fn collection_role(
        &self,
        collection: CollectionId,
        role: &RoleId,
    ) -> StoreResult<Option<CollectionRole>> {
        let state = self.state.lock().await;
        Ok(state
            .collection_roles
            .get(&(collection, role.clone()))
            .cloned())
    }

    async fn collection_roles(&self, collection: CollectionId) -> StoreResult<Vec<CollectionRole>> {
        let state = self.state.lock().await;
        Ok(state
            .collection_roles
            .values()
            .filter(|r| r.collection == collection)
            .cloned()
            .collect())
    }

    async fn add_item_role(&self, role: WorkflowItemRole) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.require_item(role.item)?;
        if state.item_roles.contains(&role) {
            return Ok(false);
        }
        state.item_roles.push(role);
        Ok(true)
    }

    async fn item_roles(&self, item: ItemId) -> StoreResult<Vec<WorkflowItemRole>> {
        let state = self.state.lock().await;
        Ok(state
            .item_roles
            .iter()
            .filter(|r| r.item == item)
            .cloned()
            .collect())
    }

    async fn open_pool_task(&self, task: PoolTask) -> StoreResult<PoolTask> {
        let mut state = self.state.lock().await;
        state.require_item(task.item)?;
        let key = task.key();
        if let Some(existing) = state
            .pool
            .values()
            .find(|t| t.matches(&key) && t.party == task.party)
        {
            return Ok(existing.clone());
        }
        state.pool.insert(task.id, task.clone());
        Ok(task)
    }

    async fn pool_by_parties(&self, parties: &[Party]) -> StoreResult<Vec<PoolTask>> {
        let state = self.state.lock().await;
        Ok(state
            .pool
            .values()
            .filter(|t| parties.contains(&t.party))
            .cloned()
            .collect())
    }

    async fn pool_by_item(&self, item: ItemId) -> StoreResult<Vec<PoolTask>> {
        let state = self.state.lock().await;
        Ok(state
            .pool
            .values()
            .filter(|t| t.item == item)
            .cloned()
            .collect())
    }

    async fn progress_by_actor(&self, actor: ActorId) -> StoreResult<Vec<InProgressUser>> {
        let state = self.state.lock().await;
        Ok(state.progress_of_actor(actor))
    }

    async fn progress_by_item(&self, item: ItemId) -> StoreResult<Vec<InProgressUser>> {
        let state = self.state.lock().await;
        Ok(state
            .progress
            .values()
            .filter(|p| p.item == item)
            .cloned()
            .collect())
    }

    async fn claim(&self, request: ClaimRequest) -> StoreResult<ClaimOutcome> {
        let mut state = self.state.lock().await;
        state.claim(request)
    }

    async fn create_owned(&self, task: ClaimedTask) -> StoreResult<ClaimedTask> {
        let mut state = self.state.lock().await;
        state.require_item(task.item)?;
        let key = task.key();
        if let Some(existing) = state
            .claimed
            .values()
            .find(|c| c.owner == task.owner && c.matches(&key))
        {
            return Ok(existing.clone());
        }
        let now = task.created_at;
        state.claimed.insert(task.id, task.clone());
        state.engage(&task, now);
        Ok(task)
    }

    async fn finish(
        &self,
        actor: ActorId,
        item: ItemId,
        step: &StepId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ClaimedTask>> {
        let mut state = self.state.lock().await;
        state.require_item(item)?;

        let held: Vec<ClaimedTaskId> = state
            .claimed
            .values()
            .filter(|c| c.owner == actor && c.item == item && &c.step == step)
            .map(|c| c.id)
            .collect();
        if held.is_empty() {
            return Ok(Vec::new());
        }

        let released: Vec<ClaimedTask> = held
            .iter()
            .filter_map(|id| state.claimed.remove(id))
            .collect();
        if let Some(row) = state.progress.get_mut(&(item, step.clone(), actor)) {
            row.finished = true;
            row.updated_at = now;
        }
        Ok(released)
    }

    async fn count_progress(&self, item: ItemId, step: &StepId) -> StoreResult<ProgressCount> {
        let state = self.state.lock().await;
        let mut count = ProgressCount::default();
        for row in state
            .progress
            .values()
            .filter(|p| p.item == item && &p.step == step)
        {
            if row.finished {
                count.finished += 1;
            } else {
                count.in_progress += 1;
            }
        }
        Ok(count)
    }

    async fn close_step(&self, item: ItemId, step: &StepId) -> StoreResult<Cleanup> {
        let mut state = self.state.lock().await;
        state.require_item(item)?;
        Ok(state.close_step(item, step))
    }

    async fn unwrap_item(&self, item: ItemId) -> StoreResult<(WorkflowItem, Cleanup)> {
        let mut state = self.state.lock().await;
        state.unwrap_item(item)
    }

    async fn claimed_by_actor(&self, actor: ActorId) -> StoreResult<Vec<ClaimedTask>> {
        let state = self.state.lock().await;
        Ok(state
            .claimed
            .values()
            .filter(|c| c.owner == actor)
            .cloned()
            .collect())
    }

    async fn claimed_by_item(&self, item: ItemId) -> StoreResult<Vec<ClaimedTask>> {
        let state = self.state.lock().await;
        Ok(state
            .claimed
            .values()
            .filter(|c| c.item == item)
            .cloned()
            .collect())
    }

    async fn totals(&self) -> StoreResult<PoolCounts> {
        let state = self.state.lock().await;
        let finished = state.progress.values().filter(|p| p.finished).count();
        Ok(PoolCounts {
            items: state.items.len(),
            pool_tasks: state.pool.len(),
            claimed_tasks: state.claimed.len(),
            in_progress: state.progress.len() - finished,
            finished,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionId, GroupId, ItemFlags, WorkflowId};
    use std::collections::BTreeSet;

    fn item() -> WorkflowItem {
        WorkflowItem::new(
            ItemId::random(),
            CollectionId::random(),
            ActorId::random(),
            ItemFlags::default(),
            Utc::now(),
        )
    }

    fn pool_task(key: &TaskKey, party: Party) -> PoolTask {
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

    fn request(actor: ActorId, key: &TaskKey, closure: BTreeSet<GroupId>) -> ClaimRequest {
        ClaimRequest {
            actor,
            key: key.clone(),
            closure,
            claim_id: ClaimedTaskId::random(),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_pool_task_requires_item() {
        let store = InMemoryTaskStore::new();
        let key = TaskKey::new(ItemId::random(), "review", "approve");

        let err = store
            .open_pool_task(pool_task(&key, ActorId::random().into()))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ItemMissing(i) if i == key.item));
    }

    #[tokio::test]
    async fn open_pool_task_is_idempotent_per_party() {
        let store = InMemoryTaskStore::new();
        let record = item();
        store.insert_item(record.clone()).await.unwrap();
        let key = TaskKey::new(record.id, "review", "approve");
        let group = GroupId::random();

        let first = store.open_pool_task(pool_task(&key, group.into())).await.unwrap();
        let second = store.open_pool_task(pool_task(&key, group.into())).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.pool_by_item(record.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_removes_every_pool_task_of_the_key() {
        let store = InMemoryTaskStore::new();
        let record = item();
        store.insert_item(record.clone()).await.unwrap();
        let approve = TaskKey::new(record.id, "review", "approve");
        let edit = TaskKey::new(record.id, "review", "edit");
        let (g1, g2) = (GroupId::random(), GroupId::random());
        let alice = ActorId::random();

        store.open_pool_task(pool_task(&approve, g1.into())).await.unwrap();
        store.open_pool_task(pool_task(&approve, g2.into())).await.unwrap();
        store.open_pool_task(pool_task(&edit, g2.into())).await.unwrap();

        let outcome = store
            .claim(request(alice, &approve, BTreeSet::from([g1])))
            .await
            .unwrap();

        assert!(matches!(outcome, ClaimOutcome::Claimed { released: 2, .. }));
        let left = store.pool_by_item(record.id).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].action, ActionId::new("edit"));
        assert_eq!(
            store.count_progress(record.id, &StepId::new("review")).await.unwrap(),
            ProgressCount { in_progress: 1, finished: 0 }
        );
    }

    #[tokio::test]
    async fn finish_without_claim_releases_nothing() {
        let store = InMemoryTaskStore::new();
        let record = item();
        store.insert_item(record.clone()).await.unwrap();

        let released = store
            .finish(ActorId::random(), record.id, &StepId::new("review"), Utc::now())
            .await
            .unwrap();

        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn unwrap_removes_item_and_rows() {
        let store = InMemoryTaskStore::new();
        let record = item();
        store.insert_item(record.clone()).await.unwrap();
        let key = TaskKey::new(record.id, "review", "approve");
        let alice = ActorId::random();
        store
            .add_item_role(WorkflowItemRole {
                item: record.id,
                role: RoleId::new("reviewer"),
                party: alice.into(),
            })
            .await
            .unwrap();
        store.open_pool_task(pool_task(&key, alice.into())).await.unwrap();
        store
            .claim(request(alice, &key, BTreeSet::new()))
            .await
            .unwrap();

        let (removed, cleanup) = store.unwrap_item(record.id).await.unwrap();

        assert_eq!(removed, record);
        assert_eq!(cleanup, Cleanup { roles: 1, pool: 0, claimed: 1, in_progress: 1 });
        assert!(store.get_item(record.id).await.unwrap().is_none());
        assert_eq!(store.totals().await.unwrap(), PoolCounts::default());
        assert!(matches!(
            store.unwrap_item(record.id).await,
            Err(StoreError::ItemMissing(_))
        ));
    }
}
