//! WorkflowItem とロールの割り当て
//!
//! - `CollectionRole`: コレクション単位のロール → グループ（永続的）
//! - `WorkflowItemRole`: アイテム単位のロール → 宛先（コレクション設定より優先）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ActorId, CollectionId, GroupId, ItemId};
use super::names::RoleId;
use super::party::Party;

/// Flags read by downstream review steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFlags {
    pub multiple_titles: bool,
    pub multiple_files: bool,
    pub published_before: bool,
}

/// The persistent wrapper around a document that is in workflow.
///
/// Root of ownership: every role, pool, claimed and in-progress row refers to
/// one of these and is removed together with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowItem {
    pub id: ItemId,
    pub collection: CollectionId,
    pub submitter: ActorId,
    #[serde(default)]
    pub flags: ItemFlags,
    pub created_at: DateTime<Utc>,
}

impl WorkflowItem {
    pub fn new(
        id: ItemId,
        collection: CollectionId,
        submitter: ActorId,
        flags: ItemFlags,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            collection,
            submitter,
            flags,
            created_at,
        }
    }
}

/// Durable `(collection, role) -> group` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRole {
    pub collection: CollectionId,
    pub role: RoleId,
    pub group: GroupId,
}

/// Ad-hoc `(item, role) -> party` assignment made while the item is in workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowItemRole {
    pub item: ItemId,
    pub role: RoleId,
    pub party: Party,
}
