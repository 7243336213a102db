//! TaskDistributionService - エンジンの公開 API
//!
//! サービスはステートレスです。呼び出しごとに所属を引き直し、ID と時刻を採番し、
//! 1 つの複合操作としてストアに渡します。複数のサービスインスタンスが
//! 1 つのストアを共有できます。
//!
//! # 流れ（claim の場合）
//! 1. MembershipDirectory からグループ閉包を取得
//! 2. TaskStore::claim がアイテム単位で直列化されたトランザクション内で判定・書き込み
//! 3. コミット後に TaskClaimed / ClaimLost を EventSink へ送信
//!
//! # 使用例
//! ```ignore
//! service.open_step_for_role(item, "default", "review", "approve", "reviewer").await?;
//! let task = service.claim(alice, item, "review", "approve").await?;
//! service.finish(alice, item, "review").await?;
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::role_resolver::RoleResolver;
use super::status::{PoolCounts, StepCounts, StepOwners};
use crate::domain::{
    ActionId, ActorId, ClaimedTask, CollectionId, CollectionRole, DomainEvent, ErrorKind, GroupId,
    ItemFlags, ItemId, ItemTasks, Party, PoolError, PoolTask, RoleId, StepId, TaskKey,
    WorkflowId, WorkflowItem, WorkflowItemRole, assemble_pool,
};
use crate::ports::{
    ClaimOutcome, ClaimRequest, Cleanup, Clock, EventSink, IdGenerator, MembershipDirectory,
    TaskStore,
};

pub type Result<T> = std::result::Result<T, PoolError>;

/// Log a failed operation at the level its kind deserves.
fn report(op: &'static str, err: &PoolError) {
    match err.kind() {
        ErrorKind::Invariant => error!(op, error = %err, "orphan write prevented"),
        ErrorKind::Infrastructure => error!(op, error = %err, "backend failure"),
        ErrorKind::Configuration => warn!(op, error = %err, "workflow misconfigured"),
        ErrorKind::Race | ErrorKind::Rejected => warn!(op, error = %err, "request refused"),
    }
}

pub struct TaskDistributionService {
    store: Arc<dyn TaskStore>,
    directory: Arc<dyn MembershipDirectory>,
    resolver: RoleResolver,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskDistributionService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        directory: Arc<dyn MembershipDirectory>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let resolver = RoleResolver::new(store.clone(), directory.clone());
        Self {
            store,
            directory,
            resolver,
            events,
            clock,
            ids,
        }
    }

    pub fn resolver(&self) -> &RoleResolver {
        &self.resolver
    }

    // ---- items ----

    /// Wrap a submitted document as a workflow item.
    pub async fn register_item(
        &self,
        collection: CollectionId,
        submitter: ActorId,
        flags: ItemFlags,
    ) -> Result<WorkflowItem> {
        let item = WorkflowItem::new(
            self.ids.generate_item_id(),
            collection,
            submitter,
            flags,
            self.clock.now(),
        );
        self.store
            .insert_item(item.clone())
            .await
            .map_err(PoolError::from)
            .inspect_err(|err| report("register_item", err))?;
        info!(item = %item.id, collection = %collection, submitter = %submitter, "registered workflow item");
        Ok(item)
    }

    pub async fn item(&self, item: ItemId) -> Result<Option<WorkflowItem>> {
        Ok(self.store.get_item(item).await?)
    }

    /// Remove the item and everything it owns, returning the item record.
    ///
    /// Used both when the item is installed and when it is rejected back to
    /// its submitter.
    #[tracing::instrument(skip_all, fields(item = %item))]
    pub async fn unwrap(&self, item: ItemId) -> Result<WorkflowItem> {
        let (record, cleanup) = self
            .store
            .unwrap_item(item)
            .await
            .map_err(PoolError::from)
            .inspect_err(|err| report("unwrap", err))?;

        info!(
            roles = cleanup.roles,
            pool = cleanup.pool,
            claimed = cleanup.claimed,
            in_progress = cleanup.in_progress,
            "unwrapped workflow item"
        );
        self.events
            .emit(DomainEvent::ItemUnwrapped {
                item,
                rows_removed: cleanup.total(),
            })
            .await;
        Ok(record)
    }

    // ---- roles ----

    /// Map `role` on `collection` to `group`, replacing any earlier mapping.
    pub async fn set_collection_role(
        &self,
        collection: CollectionId,
        role: impl Into<RoleId>,
        group: GroupId,
    ) -> Result<Option<CollectionRole>> {
        let role = role.into();
        let replaced = self
            .store
            .put_collection_role(CollectionRole {
                collection,
                role: role.clone(),
                group,
            })
            .await?;
        info!(collection = %collection, role = %role, group = %group, "collection role set");
        Ok(replaced)
    }

    pub async fn remove_collection_role(
        &self,
        collection: CollectionId,
        role: impl Into<RoleId>,
    ) -> Result<bool> {
        let role = role.into();
        let removed = self.store.delete_collection_role(collection, &role).await?;
        if removed {
            info!(collection = %collection, role = %role, "collection role removed");
        }
        Ok(removed)
    }

    pub async fn collection_roles(&self, collection: CollectionId) -> Result<Vec<CollectionRole>> {
        Ok(self.store.collection_roles(collection).await?)
    }

    /// Assign `party` to `role` on this item only. Returns false if it was
    /// already assigned.
    pub async fn assign_item_role(
        &self,
        item: ItemId,
        role: impl Into<RoleId>,
        party: impl Into<Party>,
    ) -> Result<bool> {
        let role = WorkflowItemRole {
            item,
            role: role.into(),
            party: party.into(),
        };
        let added = self
            .store
            .add_item_role(role.clone())
            .await
            .map_err(PoolError::from)
            .inspect_err(|err| report("assign_item_role", err))?;
        if added {
            info!(item = %item, role = %role.role, party = %role.party, "item role assigned");
        }
        Ok(added)
    }

    pub async fn item_roles(&self, item: ItemId) -> Result<Vec<WorkflowItemRole>> {
        Ok(self.store.item_roles(item).await?)
    }

    // ---- opening steps ----

    /// Offer (item, step, action) to `party`.
    ///
    /// Several parties may be offered the same action; offering the same party
    /// twice returns the existing pool task.
    pub async fn open_step(
        &self,
        item: ItemId,
        workflow: impl Into<WorkflowId>,
        step: impl Into<StepId>,
        action: impl Into<ActionId>,
        party: impl Into<Party>,
    ) -> Result<PoolTask> {
        let task = PoolTask {
            id: self.ids.generate_pool_task_id(),
            item,
            workflow: workflow.into(),
            step: step.into(),
            action: action.into(),
            party: party.into(),
            created_at: self.clock.now(),
        };
        self.open_pool_task(task)
            .await
            .inspect_err(|err| report("open_step", err))
    }

    /// Resolve `role` for the item and offer the action to every resolved party.
    pub async fn open_step_for_role(
        &self,
        item: ItemId,
        workflow: impl Into<WorkflowId>,
        step: impl Into<StepId>,
        action: impl Into<ActionId>,
        role: impl Into<RoleId>,
    ) -> Result<Vec<PoolTask>> {
        let key = TaskKey::new(item, step, action);
        self.open_for_role(key, workflow.into(), role.into())
            .await
            .inspect_err(|err| report("open_step_for_role", err))
    }

    async fn open_for_role(
        &self,
        key: TaskKey,
        workflow: WorkflowId,
        role: RoleId,
    ) -> Result<Vec<PoolTask>> {
        let record = self
            .store
            .get_item(key.item)
            .await?
            .ok_or(PoolError::ItemNotFound(key.item))?;
        let parties = self.resolver.item_parties(&record, &role).await?;
        debug!(key = %key, role = %role, parties = parties.len(), "resolved role");

        let mut opened = Vec::with_capacity(parties.len());
        for party in parties {
            let task = PoolTask {
                id: self.ids.generate_pool_task_id(),
                item: key.item,
                workflow: workflow.clone(),
                step: key.step.clone(),
                action: key.action.clone(),
                party,
                created_at: self.clock.now(),
            };
            opened.push(self.open_pool_task(task).await?);
        }
        Ok(opened)
    }

    async fn open_pool_task(&self, task: PoolTask) -> Result<PoolTask> {
        let requested = task.id;
        let stored = self.store.open_pool_task(task).await?;
        if stored.id == requested {
            info!(task = %stored.id, key = %stored.key(), party = %stored.party, "step opened");
            self.events
                .emit(DomainEvent::StepOpened {
                    key: stored.key(),
                    party: stored.party,
                })
                .await;
        } else {
            debug!(task = %stored.id, party = %stored.party, "party already offered this action");
        }
        Ok(stored)
    }

    // ---- pool and claims ----

    /// Everything `actor` may claim right now, one entry per (item, step, action).
    pub async fn pool_for(&self, actor: ActorId) -> Result<Vec<PoolTask>> {
        let closure = self.resolver.closure(actor).await?;

        let mut parties: Vec<Party> = Vec::with_capacity(closure.len() + 1);
        parties.push(Party::Actor(actor));
        parties.extend(closure.iter().copied().map(Party::Group));

        let candidates = self.store.pool_by_parties(&parties).await?;
        let progress = self.store.progress_by_actor(actor).await?;
        let pool = assemble_pool(actor, &closure, candidates, &progress);

        debug!(actor = %actor, groups = closure.len(), tasks = pool.len(), "assembled pool");
        Ok(pool)
    }

    /// `actor` として (item, step, action) をクレームする
    ///
    /// # 結果
    /// - 既に自分が持っている: そのタスクを返す（書き込みなし）
    /// - 競合に負けた: [`PoolError::AlreadyClaimed`]（呼び出し側はプールを引き直す）
    /// - プール行はあるが自分には提示されていない: [`PoolError::NotEligible`]
    ///
    /// # 例
    /// ```ignore
    /// match service.claim(bob, item, "review", "approve").await {
    ///     Ok(task) => start_review(task),
    ///     Err(err) if err.is_already_claimed() => refresh_pool().await,
    ///     Err(err) => return Err(err.into()),
    /// }
    /// ```
    #[tracing::instrument(skip_all, fields(actor = %actor, item = %item))]
    pub async fn claim(
        &self,
        actor: ActorId,
        item: ItemId,
        step: impl Into<StepId>,
        action: impl Into<ActionId>,
    ) -> Result<ClaimedTask> {
        let key = TaskKey::new(item, step, action);
        self.claim_key(actor, key)
            .await
            .inspect_err(|err| report("claim", err))
    }

    async fn claim_key(&self, actor: ActorId, key: TaskKey) -> Result<ClaimedTask> {
        let closure = self.resolver.closure(actor).await?;
        let request = ClaimRequest {
            actor,
            key: key.clone(),
            closure,
            claim_id: self.ids.generate_claimed_task_id(),
            now: self.clock.now(),
        };

        match self.store.claim(request).await? {
            ClaimOutcome::Claimed { task, released } => {
                info!(key = %key, released, "task claimed");
                self.events
                    .emit(DomainEvent::TaskClaimed {
                        key,
                        actor,
                        released,
                    })
                    .await;
                Ok(task)
            }
            ClaimOutcome::AlreadyHeld(task) => {
                debug!(key = %key, "claim repeated by current holder");
                Ok(task)
            }
            ClaimOutcome::Lost { holder } => {
                self.events
                    .emit(DomainEvent::ClaimLost {
                        key: key.clone(),
                        actor,
                        holder,
                    })
                    .await;
                Err(PoolError::AlreadyClaimed { key, holder })
            }
            ClaimOutcome::NotEligible => Err(PoolError::NotEligible { actor, key }),
        }
    }

    /// Hand (item, step, action) straight to `actor` without a pool task.
    #[tracing::instrument(skip_all, fields(actor = %actor, item = %item))]
    pub async fn create_owned_task(
        &self,
        item: ItemId,
        workflow: impl Into<WorkflowId>,
        step: impl Into<StepId>,
        action: impl Into<ActionId>,
        actor: ActorId,
    ) -> Result<ClaimedTask> {
        let requested = ClaimedTask {
            id: self.ids.generate_claimed_task_id(),
            item,
            workflow: workflow.into(),
            step: step.into(),
            action: action.into(),
            owner: actor,
            created_at: self.clock.now(),
        };
        let requested_id = requested.id;
        let task = self
            .store
            .create_owned(requested)
            .await
            .map_err(PoolError::from)
            .inspect_err(|err| report("create_owned_task", err))?;

        if task.id == requested_id {
            info!(key = %task.key(), "task assigned");
            self.events
                .emit(DomainEvent::TaskClaimed {
                    key: task.key(),
                    actor,
                    released: 0,
                })
                .await;
        }
        Ok(task)
    }

    /// Record that `actor` finished its part of `step`. Returns the claimed
    /// tasks that were released.
    #[tracing::instrument(skip_all, fields(actor = %actor, item = %item))]
    pub async fn finish(
        &self,
        actor: ActorId,
        item: ItemId,
        step: impl Into<StepId>,
    ) -> Result<Vec<ClaimedTask>> {
        let step = step.into();
        let released = self
            .finish_step(actor, item, &step)
            .await
            .inspect_err(|err| report("finish", err))?;

        info!(step = %step, released = released.len(), "step finished by actor");
        self.events
            .emit(DomainEvent::StepFinished {
                item,
                step,
                actor,
            })
            .await;
        Ok(released)
    }

    async fn finish_step(
        &self,
        actor: ActorId,
        item: ItemId,
        step: &StepId,
    ) -> Result<Vec<ClaimedTask>> {
        let released = self
            .store
            .finish(actor, item, step, self.clock.now())
            .await?;
        if released.is_empty() {
            return Err(PoolError::NothingToFinish {
                actor,
                item,
                step: step.clone(),
            });
        }
        Ok(released)
    }

    /// Drop every pool and claimed task of `step` and the item's in-progress
    /// rows. Called once the step's outcome is decided.
    #[tracing::instrument(skip_all, fields(item = %item))]
    pub async fn close_step(&self, item: ItemId, step: impl Into<StepId>) -> Result<Cleanup> {
        let step = step.into();
        let cleanup = self
            .store
            .close_step(item, &step)
            .await
            .map_err(PoolError::from)
            .inspect_err(|err| report("close_step", err))?;

        info!(
            step = %step,
            pool = cleanup.pool,
            claimed = cleanup.claimed,
            in_progress = cleanup.in_progress,
            "step closed"
        );
        self.events.emit(DomainEvent::StepClosed { item, step }).await;
        Ok(cleanup)
    }

    // ---- counts ----

    pub async fn count_in_progress(&self, item: ItemId, step: impl Into<StepId>) -> Result<usize> {
        let step = step.into();
        Ok(self.store.count_progress(item, &step).await?.in_progress)
    }

    pub async fn count_finished(&self, item: ItemId, step: impl Into<StepId>) -> Result<usize> {
        let step = step.into();
        Ok(self.store.count_progress(item, &step).await?.finished)
    }

    pub async fn step_counts(&self, item: ItemId, step: impl Into<StepId>) -> Result<StepCounts> {
        let step = step.into();
        let progress = self.store.count_progress(item, &step).await?;
        let pool_tasks = self
            .store
            .pool_by_item(item)
            .await?
            .iter()
            .filter(|t| t.step == step)
            .count();
        let claimed_tasks = self
            .store
            .claimed_by_item(item)
            .await?
            .iter()
            .filter(|c| c.step == step)
            .count();
        Ok(StepCounts {
            pool_tasks,
            claimed_tasks,
            in_progress: progress.in_progress,
            finished: progress.finished,
        })
    }

    pub async fn pool_counts(&self) -> Result<PoolCounts> {
        Ok(self.store.totals().await?)
    }

    // ---- inspection ----

    pub async fn find_by_actor(&self, actor: ActorId) -> Result<Vec<ClaimedTask>> {
        Ok(self.store.claimed_by_actor(actor).await?)
    }

    /// Every row the item owns.
    pub async fn find_by_item(&self, item: ItemId) -> Result<ItemTasks> {
        Ok(ItemTasks {
            roles: self.store.item_roles(item).await?,
            pool: self.store.pool_by_item(item).await?,
            claimed: self.store.claimed_by_item(item).await?,
            in_progress: self.store.progress_by_item(item).await?,
        })
    }

    pub async fn find_claimed(&self, actor: ActorId, item: ItemId) -> Result<Vec<ClaimedTask>> {
        Ok(self
            .store
            .claimed_by_item(item)
            .await?
            .into_iter()
            .filter(|c| c.owner == actor)
            .collect())
    }

    pub async fn find_pool_by_group(&self, group: GroupId) -> Result<Vec<PoolTask>> {
        Ok(self.store.pool_by_parties(&[Party::Group(group)]).await?)
    }

    /// Actors and groups currently holding `step`: parties of its open pool
    /// tasks plus the owners of its claimed tasks.
    pub async fn current_owners(&self, item: ItemId, step: impl Into<StepId>) -> Result<StepOwners> {
        let step = step.into();
        let mut actors = BTreeSet::new();
        let mut groups = BTreeSet::new();

        for task in self.store.pool_by_item(item).await? {
            if task.step != step {
                continue;
            }
            match task.party {
                Party::Actor(actor) => actors.insert(actor),
                Party::Group(group) => groups.insert(group),
            };
        }
        for task in self.store.claimed_by_item(item).await? {
            if task.step == step {
                actors.insert(task.owner);
            }
        }

        Ok(StepOwners {
            actors: actors.into_iter().collect(),
            groups: groups.into_iter().collect(),
        })
    }

    /// Refuse to let `actor` leave `group` when that would strand the group's
    /// pool tasks with nobody able to claim them.
    pub async fn check_member_removal(&self, group: GroupId, actor: ActorId) -> Result<()> {
        let waiting = self.store.pool_by_parties(&[Party::Group(group)]).await?;
        if waiting.is_empty() {
            return Ok(());
        }

        let members = self.directory.all_members(group).await?;
        if members.len() == 1 && members.contains(&actor) {
            let err = PoolError::MemberRemovalRefused { group, actor };
            report("check_member_removal", &err);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryDirectory, InMemoryTaskStore, RecordingEventSink};
    use crate::ports::{SystemClock, UlidGenerator};

    struct Fixture {
        service: TaskDistributionService,
        directory: InMemoryDirectory,
        events: RecordingEventSink,
        item: WorkflowItem,
    }

    async fn fixture() -> Fixture {
        let directory = InMemoryDirectory::new();
        let events = RecordingEventSink::new();
        let service = TaskDistributionService::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(directory.clone()),
            Arc::new(events.clone()),
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        );
        let item = service
            .register_item(CollectionId::random(), ActorId::random(), ItemFlags::default())
            .await
            .unwrap();
        Fixture {
            service,
            directory,
            events,
            item,
        }
    }

    #[tokio::test]
    async fn open_step_rejects_unknown_item() {
        let f = fixture().await;
        let err = f
            .service
            .open_step(ItemId::random(), "wf", "review", "approve", ActorId::random())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }

    #[tokio::test]
    async fn open_step_twice_for_same_party_emits_once() {
        let f = fixture().await;
        let group = GroupId::random();
        let first = f.service.open_step(f.item.id, "wf", "review", "approve", group).await.unwrap();
        let second = f.service.open_step(f.item.id, "wf", "review", "approve", group).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.events.names().await, vec!["step_opened"]);
    }

    #[tokio::test]
    async fn open_step_for_role_without_mapping_fails() {
        let f = fixture().await;
        let err = f
            .service
            .open_step_for_role(f.item.id, "wf", "review", "approve", "reviewer")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn claim_then_finish_updates_counts() {
        let f = fixture().await;
        let group = GroupId::random();
        let alice = ActorId::random();
        f.directory.add_member(group, alice).await;
        f.service.open_step(f.item.id, "wf", "review", "approve", group).await.unwrap();

        f.service.claim(alice, f.item.id, "review", "approve").await.unwrap();
        assert_eq!(f.service.count_in_progress(f.item.id, "review").await.unwrap(), 1);

        f.service.finish(alice, f.item.id, "review").await.unwrap();
        assert_eq!(f.service.count_in_progress(f.item.id, "review").await.unwrap(), 0);
        assert_eq!(f.service.count_finished(f.item.id, "review").await.unwrap(), 1);

        let err = f.service.finish(alice, f.item.id, "review").await.unwrap_err();
        assert!(matches!(err, PoolError::NothingToFinish { .. }));
        assert_eq!(
            f.events.names().await,
            vec!["step_opened", "task_claimed", "step_finished"]
        );
    }

    #[tokio::test]
    async fn claim_by_outsider_is_not_eligible() {
        let f = fixture().await;
        f.service
            .open_step(f.item.id, "wf", "review", "approve", GroupId::random())
            .await
            .unwrap();

        let err = f
            .service
            .claim(ActorId::random(), f.item.id, "review", "approve")
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotEligible { .. }));
        assert_eq!(f.service.pool_counts().await.unwrap().pool_tasks, 1);
    }

    #[tokio::test]
    async fn owned_task_counts_as_in_progress() {
        let f = fixture().await;
        let alice = ActorId::random();
        let first = f
            .service
            .create_owned_task(f.item.id, "wf", "edit", "editaction", alice)
            .await
            .unwrap();
        let again = f
            .service
            .create_owned_task(f.item.id, "wf", "edit", "editaction", alice)
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(f.service.find_claimed(alice, f.item.id).await.unwrap().len(), 1);
        assert_eq!(f.service.count_in_progress(f.item.id, "edit").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn current_owners_lists_parties_and_holders() {
        let f = fixture().await;
        let group = GroupId::random();
        let (alice, bob) = (ActorId::random(), ActorId::random());
        f.service.open_step(f.item.id, "wf", "review", "approve", group).await.unwrap();
        f.service.open_step(f.item.id, "wf", "review", "reject", bob).await.unwrap();
        f.service
            .create_owned_task(f.item.id, "wf", "review", "edit", alice)
            .await
            .unwrap();

        let owners = f.service.current_owners(f.item.id, "review").await.unwrap();
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(owners.actors, expected);
        assert_eq!(owners.groups, vec![group]);
    }

    #[tokio::test]
    async fn removing_last_member_of_group_with_tasks_is_refused() {
        let f = fixture().await;
        let group = GroupId::random();
        let (alice, bob) = (ActorId::random(), ActorId::random());
        f.directory.add_member(group, alice).await;

        assert!(f.service.check_member_removal(group, alice).await.is_ok());

        f.service.open_step(f.item.id, "wf", "review", "approve", group).await.unwrap();
        let err = f.service.check_member_removal(group, alice).await.unwrap_err();
        assert!(matches!(err, PoolError::MemberRemovalRefused { .. }));

        f.directory.add_member(group, bob).await;
        assert!(f.service.check_member_removal(group, alice).await.is_ok());
    }

    #[tokio::test]
    async fn close_step_clears_the_step() {
        let f = fixture().await;
        let alice = ActorId::random();
        f.service.open_step(f.item.id, "wf", "review", "approve", alice).await.unwrap();
        f.service.open_step(f.item.id, "wf", "review", "reject", alice).await.unwrap();
        f.service.claim(alice, f.item.id, "review", "approve").await.unwrap();

        let cleanup = f.service.close_step(f.item.id, "review").await.unwrap();

        assert_eq!(cleanup, Cleanup { roles: 0, pool: 1, claimed: 1, in_progress: 1 });
        assert_eq!(f.service.step_counts(f.item.id, "review").await.unwrap(), StepCounts::default());
    }
}
