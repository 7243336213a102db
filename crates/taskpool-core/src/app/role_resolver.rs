//! RoleResolver - ロール名から、そのロールで行動できる宛先へ
//!
//! # 解決順序
//! 1. アイテム単位のロール（あれば必ず優先）
//! 2. コレクション単位のロール
//! 3. どちらもなければ `NoEligibleParty`

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::domain::{ActorId, CollectionId, GroupId, Party, PoolError, RoleId, WorkflowItem};
use crate::ports::{MembershipDirectory, TaskStore};

/// Resolves roles against the role stores and actors against the directory.
///
/// Nothing is cached: every call reads the stores and the directory again, so a
/// membership change is visible to the very next `pool_for` or `claim`.
#[derive(Clone)]
pub struct RoleResolver {
    store: Arc<dyn TaskStore>,
    directory: Arc<dyn MembershipDirectory>,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn TaskStore>, directory: Arc<dyn MembershipDirectory>) -> Self {
        Self { store, directory }
    }

    /// Every group `actor` belongs to, directly or through nesting.
    pub async fn closure(&self, actor: ActorId) -> Result<BTreeSet<GroupId>, PoolError> {
        let closure = self.directory.group_closure(actor).await?;
        debug!(actor = %actor, groups = closure.len(), "resolved group closure");
        Ok(closure)
    }

    /// The group mapped to `role` on `collection`.
    pub async fn collection_group(
        &self,
        collection: CollectionId,
        role: &RoleId,
    ) -> Result<GroupId, PoolError> {
        self.store
            .collection_role(collection, role)
            .await?
            .map(|mapping| mapping.group)
            .ok_or_else(|| PoolError::NoEligibleParty {
                scope: collection.to_string(),
                role: role.clone(),
            })
    }

    /// Parties responsible for `role` on `item`.
    ///
    /// Per-item assignments win; without any, the item's collection mapping is
    /// used. Neither present is a configuration error.
    pub async fn item_parties(
        &self,
        item: &WorkflowItem,
        role: &RoleId,
    ) -> Result<Vec<Party>, PoolError> {
        let assigned: Vec<Party> = self
            .store
            .item_roles(item.id)
            .await?
            .into_iter()
            .filter(|r| &r.role == role)
            .map(|r| r.party)
            .collect();
        if !assigned.is_empty() {
            return Ok(assigned);
        }

        match self.collection_group(item.collection, role).await {
            Ok(group) => Ok(vec![Party::Group(group)]),
            Err(PoolError::NoEligibleParty { .. }) => Err(PoolError::NoEligibleParty {
                scope: item.id.to_string(),
                role: role.clone(),
            }),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CollectionRole, ItemFlags, ItemId, WorkflowItemRole};
    use crate::impls::{InMemoryDirectory, InMemoryTaskStore};
    use chrono::Utc;

    async fn setup() -> (RoleResolver, Arc<InMemoryTaskStore>, WorkflowItem) {
        let store = Arc::new(InMemoryTaskStore::new());
        let item = WorkflowItem::new(
            ItemId::random(),
            CollectionId::random(),
            ActorId::random(),
            ItemFlags::default(),
            Utc::now(),
        );
        store.insert_item(item.clone()).await.unwrap();
        let resolver = RoleResolver::new(store.clone(), Arc::new(InMemoryDirectory::new()));
        (resolver, store, item)
    }

    #[tokio::test]
    async fn falls_back_to_collection_role() {
        let (resolver, store, item) = setup().await;
        let group = GroupId::random();
        store
            .put_collection_role(CollectionRole {
                collection: item.collection,
                role: RoleId::new("reviewer"),
                group,
            })
            .await
            .unwrap();

        let parties = resolver.item_parties(&item, &RoleId::new("reviewer")).await.unwrap();
        assert_eq!(parties, vec![Party::Group(group)]);
    }

    #[tokio::test]
    async fn item_assignments_take_precedence() {
        let (resolver, store, item) = setup().await;
        let (alice, bob) = (ActorId::random(), ActorId::random());
        store
            .put_collection_role(CollectionRole {
                collection: item.collection,
                role: RoleId::new("reviewer"),
                group: GroupId::random(),
            })
            .await
            .unwrap();
        for actor in [alice, bob] {
            store
                .add_item_role(WorkflowItemRole {
                    item: item.id,
                    role: RoleId::new("reviewer"),
                    party: actor.into(),
                })
                .await
                .unwrap();
        }

        let parties = resolver.item_parties(&item, &RoleId::new("reviewer")).await.unwrap();
        assert_eq!(parties, vec![Party::Actor(alice), Party::Actor(bob)]);
    }

    #[tokio::test]
    async fn missing_mapping_is_a_configuration_error() {
        let (resolver, _store, item) = setup().await;
        let err = resolver
            .item_parties(&item, &RoleId::new("editor"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NoEligibleParty { ref role, .. } if role.as_str() == "editor"));
    }
}
