//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてエンジンの操作を実装します。
//!
//! # 主要コンポーネント
//! - **TaskDistributionService**: open / pool / claim / finish / close / unwrap / 照会
//! - **RoleResolver**: ロール → 宛先、Actor → グループ閉包
//! - **ServiceBuilder**: ワイヤリング（Fail-fast 検証）
//! - **status**: カウント表示用の型

pub mod builder;
pub mod distribution;
pub mod role_resolver;
pub mod status;

pub use self::builder::{BuildError, ServiceBuilder, open_store};
pub use self::distribution::TaskDistributionService;
pub use self::role_resolver::RoleResolver;
pub use self::status::{PoolCounts, StepCounts, StepOwners};
