//! IdGenerator port - ID 生成
//!
//! ID はストアのトランザクションの外、サービス側で採番します。
//! 複数のステートレスなサービスインスタンスが、シーケンスなしで 1 つのストアを
//! 共有できます。

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{ClaimedTaskId, ItemId, PoolTaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_item_id(&self) -> ItemId;

    fn generate_pool_task_id(&self) -> PoolTaskId;

    fn generate_claimed_task_id(&self) -> ClaimedTaskId;
}

/// ULID generator taking its timestamp from a [`Clock`].
///
/// With a `FixedClock` the timestamp part is deterministic; the random part
/// still keeps ids unique.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_item_id(&self) -> ItemId {
        ItemId::from(self.next())
    }

    fn generate_pool_task_id(&self) -> PoolTaskId {
        PoolTaskId::from(self.next())
    }

    fn generate_claimed_task_id(&self) -> ClaimedTaskId {
        ClaimedTaskId::from(self.next())
    }
}

impl<T: IdGenerator + ?Sized> IdGenerator for Arc<T> {
    fn generate_item_id(&self) -> ItemId {
        (**self).generate_item_id()
    }

    fn generate_pool_task_id(&self) -> PoolTaskId {
        (**self).generate_pool_task_id()
    }

    fn generate_claimed_task_id(&self) -> ClaimedTaskId {
        (**self).generate_claimed_task_id()
    }
}
