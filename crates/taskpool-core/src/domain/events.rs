//! Events - ドメインイベント
//!
//! コミット後に EventSink へ送られる、監査・利用統計用のイベントです。
//!
//! # イベント種類
//! - StepOpened / TaskClaimed / ClaimLost
//! - StepFinished / StepClosed / ItemUnwrapped

use serde::{Deserialize, Serialize};

use super::ids::{ActorId, ItemId};
use super::names::StepId;
use super::party::Party;
use super::task::TaskKey;

/// DomainEvent はコミットされた変更ごとに発行されるイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    StepOpened {
        key: TaskKey,
        party: Party,
    },
    TaskClaimed {
        key: TaskKey,
        actor: ActorId,
        /// Pool tasks removed because the claim consumed the opportunity.
        released: usize,
    },
    ClaimLost {
        key: TaskKey,
        actor: ActorId,
        holder: Option<ActorId>,
    },
    StepFinished {
        item: ItemId,
        step: StepId,
        actor: ActorId,
    },
    StepClosed {
        item: ItemId,
        step: StepId,
    },
    ItemUnwrapped {
        item: ItemId,
        rows_removed: usize,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::StepOpened { .. } => "step_opened",
            DomainEvent::TaskClaimed { .. } => "task_claimed",
            DomainEvent::ClaimLost { .. } => "claim_lost",
            DomainEvent::StepFinished { .. } => "step_finished",
            DomainEvent::StepClosed { .. } => "step_closed",
            DomainEvent::ItemUnwrapped { .. } => "item_unwrapped",
        }
    }

    pub fn item(&self) -> ItemId {
        match self {
            DomainEvent::StepOpened { key, .. }
            | DomainEvent::TaskClaimed { key, .. }
            | DomainEvent::ClaimLost { key, .. } => key.item,
            DomainEvent::StepFinished { item, .. }
            | DomainEvent::StepClosed { item, .. }
            | DomainEvent::ItemUnwrapped { item, .. } => *item,
        }
    }
}
