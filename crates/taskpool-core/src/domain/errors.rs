//! Errors - エラー型と分類
//!
//! # ErrorKind（運用分類）
//! - Configuration: ロール設定の不足（管理者が直す）
//! - Race: 他の誰かが先にクレームした（想定内）
//! - Rejected: 呼び出し側の要求が規則に合わない
//! - Invariant: 存在しないアイテムへの書き込みなど、起きてはいけない状態
//! - Infrastructure: ストア・ディレクトリの障害
//!
//! ログレベルは kind で決めます（`app::distribution` 参照）。

use thiserror::Error;

use super::ids::{ActorId, GroupId, ItemId};
use super::names::{RoleId, StepId};
use super::task::TaskKey;
use crate::ports::{DirectoryError, StoreError};

/// ErrorKind はエラーの運用分類（呼び出し側がどう反応すべきか）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Workflow configuration is incomplete; the request cannot succeed as-is.
    Configuration,
    /// Lost a race with another caller. Re-query and present fresh options.
    Race,
    /// The caller asked for something the rules do not allow.
    Rejected,
    /// A row would reference a missing workflow item. Should never happen.
    Invariant,
    /// Store or membership backend failure.
    Infrastructure,
}

/// PoolError は TaskDistributionService が返すドメインエラー
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no eligible party for role '{role}' on {scope}")]
    NoEligibleParty { scope: String, role: RoleId },

    #[error("task {key} is already claimed")]
    AlreadyClaimed {
        key: TaskKey,
        holder: Option<ActorId>,
    },

    #[error("{actor} is not eligible to claim {key}")]
    NotEligible { actor: ActorId, key: TaskKey },

    #[error("workflow item {0} does not exist")]
    ItemNotFound(ItemId),

    #[error("workflow item {0} is already registered")]
    DuplicateItem(ItemId),

    #[error("{actor} holds no claimed task in step '{step}' of {item}")]
    NothingToFinish {
        actor: ActorId,
        item: ItemId,
        step: StepId,
    },

    #[error("refused to remove {actor} from {group}: the group has pool tasks and no other members")]
    MemberRemovalRefused { group: GroupId, actor: ActorId },

    #[error("store error: {0}")]
    Storage(#[source] StoreError),

    #[error("membership lookup failed: {0}")]
    Membership(#[from] DirectoryError),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::NoEligibleParty { .. } => ErrorKind::Configuration,
            PoolError::AlreadyClaimed { .. } => ErrorKind::Race,
            PoolError::NotEligible { .. }
            | PoolError::NothingToFinish { .. }
            | PoolError::DuplicateItem(_)
            | PoolError::MemberRemovalRefused { .. } => ErrorKind::Rejected,
            PoolError::ItemNotFound(_) => ErrorKind::Invariant,
            PoolError::Storage(_) | PoolError::Membership(_) => ErrorKind::Infrastructure,
        }
    }

    /// True for the expected "someone else got there first" outcome.
    pub fn is_already_claimed(&self) -> bool {
        matches!(self, PoolError::AlreadyClaimed { .. })
    }
}

impl From<StoreError> for PoolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ItemMissing(item) => PoolError::ItemNotFound(item),
            StoreError::DuplicateItem(item) => PoolError::DuplicateItem(item),
            other => PoolError::Storage(other),
        }
    }
}
