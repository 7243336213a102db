//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部の協調者を 1 つずつ隠蔽します。
//!
//! # 主要な trait
//! - **TaskStore**: トランザクションを持つ正本（source of truth）
//! - **MembershipDirectory**: グループ所属（入れ子グループを含む）
//! - **EventSink**: 監査・利用イベントの配送
//! - **Clock / IdGenerator**: 時刻と ID（テストで差し替え可能）

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod membership;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::membership::{DirectoryError, MembershipDirectory};
pub use self::task_store::{
    ClaimOutcome, ClaimRequest, Cleanup, PoolCounts, ProgressCount, StoreError, StoreResult,
    TaskStore,
};
