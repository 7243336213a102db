//! Domain - ドメインモデル
//!
//! I/O を持たない型と純粋関数だけを置きます。
//!
//! # 構成
//! - **ids**: ULID ベースの強い型付き ID
//! - **names**: ワークフロー定義由来の名前（workflow, step, action, role）
//! - **party**: タスクの宛先（Actor または Group）
//! - **item / task**: ストアが保持する行
//! - **eligibility**: 誰に何を見せ、誰のクレームを通すかの規則
//! - **errors / events**: エラー分類とドメインイベント

pub mod eligibility;
pub mod errors;
pub mod events;
pub mod ids;
pub mod item;
pub mod names;
pub mod party;
pub mod task;

pub use self::eligibility::{ClaimDecision, assemble_pool, decide_claim, is_offered};
pub use self::errors::{ErrorKind, PoolError};
pub use self::events::DomainEvent;
pub use self::ids::{ActorId, ClaimedTaskId, CollectionId, GroupId, ItemId, PoolTaskId};
pub use self::item::{CollectionRole, ItemFlags, WorkflowItem, WorkflowItemRole};
pub use self::names::{ActionId, RoleId, StepId, WorkflowId};
pub use self::party::Party;
pub use self::task::{ClaimedTask, InProgressUser, ItemTasks, PoolTask, TaskKey};
