//! MembershipDirectory port - 外部のグループ所属ストア
//!
//! エンジンは所属を読むだけです。入れ子グループの展開はディレクトリ側の責務です。
//! 所属は呼び出しごとに引き直し、キャッシュしません。

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ActorId, GroupId};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("membership backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// Every group `actor` belongs to, directly or through parent groups.
    async fn group_closure(&self, actor: ActorId) -> Result<BTreeSet<GroupId>, DirectoryError>;

    /// Every actor in `group`, including members of nested subgroups.
    async fn all_members(&self, group: GroupId) -> Result<BTreeSet<ActorId>, DirectoryError>;
}
