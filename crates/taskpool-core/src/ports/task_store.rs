//! TaskStore port - エンジンの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - ワークフローアイテム
//! - コレクションロール・アイテムロール
//! - プールタスク・クレーム済みタスク・進行中ユーザー
//!
//! # 実装
//! - [`InMemoryTaskStore`](crate::impls::InMemoryTaskStore): テスト・デモ・単一プロセス用
//! - [`SqliteTaskStore`](crate::impls::SqliteTaskStore): feature `sqlite`

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    ActorId, ClaimedTask, ClaimedTaskId, CollectionId, CollectionRole, GroupId, InProgressUser,
    ItemId, Party, PoolTask, RoleId, StepId, TaskKey, WorkflowItem, WorkflowItemRole,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow item {0} does not exist")]
    ItemMissing(ItemId),

    #[error("workflow item {0} already exists")]
    DuplicateItem(ItemId),

    #[error("stored row is malformed: {0}")]
    Corrupt(String),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Everything a claim transaction needs besides the stored rows.
///
/// `closure` must be fetched for this request only; reusing one across
/// requests would let stale membership decide a claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub actor: ActorId,
    pub key: TaskKey,
    pub closure: BTreeSet<GroupId>,
    /// Id to use if a new claimed task is created.
    pub claim_id: ClaimedTaskId,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// New claim written; `released` pool tasks were deleted with it.
    Claimed { task: ClaimedTask, released: usize },
    /// The actor already held the task. Nothing was written.
    AlreadyHeld(ClaimedTask),
    Lost { holder: Option<ActorId> },
    NotEligible,
}

/// Row counts removed by a cascading delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cleanup {
    pub roles: usize,
    pub pool: usize,
    pub claimed: usize,
    pub in_progress: usize,
}

impl Cleanup {
    pub fn total(&self) -> usize {
        self.roles + self.pool + self.claimed + self.in_progress
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCount {
    pub in_progress: usize,
    pub finished: usize,
}

/// Store-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    pub items: usize,
    pub pool_tasks: usize,
    pub claimed_tasks: usize,
    pub in_progress: usize,
    pub finished: usize,
}

/// TaskStore はタスクプールの正本（source of truth）
///
/// # 設計原則
/// - `open_pool_task` / `claim` / `create_owned` / `finish` / `close_step` /
///   `unwrap_item` はそれぞれ 1 トランザクションで、アイテム単位に直列化される。
///   途中の状態は外から見えない
/// - アイテムを参照する行は、アイテムが存在する間だけ書ける
///   （なければ `StoreError::ItemMissing`）
/// - 読み取りは書き込みを長く止めない。古い値を返すことはある
/// - 誰に見せるか・誰のクレームを通すかは [`crate::domain::eligibility`] の
///   純粋関数で決める（実装ごとに判定がずれないように）
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_item(&self, item: WorkflowItem) -> StoreResult<()>;

    async fn get_item(&self, item: ItemId) -> StoreResult<Option<WorkflowItem>>;

    /// Insert or replace the group for (collection, role). Returns the replaced row.
    async fn put_collection_role(&self, role: CollectionRole)
    -> StoreResult<Option<CollectionRole>>;

    async fn delete_collection_role(
        &self,
        collection: CollectionId,
        role: &RoleId,
    ) -> StoreResult<bool>;

    async fn collection_role(
        &self,
        collection: CollectionId,
        role: &RoleId,
    ) -> StoreResult<Option<CollectionRole>>;

    async fn collection_roles(&self, collection: CollectionId) -> StoreResult<Vec<CollectionRole>>;

    /// Returns false when the same assignment already exists.
    async fn add_item_role(&self, role: WorkflowItemRole) -> StoreResult<bool>;

    async fn item_roles(&self, item: ItemId) -> StoreResult<Vec<WorkflowItemRole>>;

    /// Insert a pool task. If a row for the same key and party exists, that
    /// row is returned instead.
    async fn open_pool_task(&self, task: PoolTask) -> StoreResult<PoolTask>;

    /// Pool tasks addressed to any of `parties`.
    async fn pool_by_parties(&self, parties: &[Party]) -> StoreResult<Vec<PoolTask>>;

    async fn pool_by_item(&self, item: ItemId) -> StoreResult<Vec<PoolTask>>;

    async fn progress_by_actor(&self, actor: ActorId) -> StoreResult<Vec<InProgressUser>>;

    async fn progress_by_item(&self, item: ItemId) -> StoreResult<Vec<InProgressUser>>;

    /// Evaluate and apply a claim with
    /// [`decide_claim`](crate::domain::decide_claim) inside one transaction.
    async fn claim(&self, request: ClaimRequest) -> StoreResult<ClaimOutcome>;

    /// Write a claimed task without a pool task (auto-assignment).
    /// Returns the existing row if the owner already holds the key.
    async fn create_owned(&self, task: ClaimedTask) -> StoreResult<ClaimedTask>;

    /// Mark the actor finished in `step` and delete its claimed tasks there.
    /// Returns the deleted claimed tasks; empty means nothing was held.
    async fn finish(
        &self,
        actor: ActorId,
        item: ItemId,
        step: &StepId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ClaimedTask>>;

    async fn count_progress(&self, item: ItemId, step: &StepId) -> StoreResult<ProgressCount>;

    /// Delete pool and claimed tasks of `step` and every in-progress row of the item.
    async fn close_step(&self, item: ItemId, step: &StepId) -> StoreResult<Cleanup>;

    /// Delete the item and everything it owns.
    async fn unwrap_item(&self, item: ItemId) -> StoreResult<(WorkflowItem, Cleanup)>;

    async fn claimed_by_actor(&self, actor: ActorId) -> StoreResult<Vec<ClaimedTask>>;

    async fn claimed_by_item(&self, item: ItemId) -> StoreResult<Vec<ClaimedTask>>;

    async fn totals(&self) -> StoreResult<PoolCounts>;
}
