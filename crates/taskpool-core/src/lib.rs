//! taskpool-core
//!
//! 複数ステップの編集ワークフロー向けタスクプール / クレームエンジン。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, names, party, item, task, eligibility, errors, events）
//! - **ports**: 抽象化レイヤー（TaskStore, MembershipDirectory, EventSink, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（TaskDistributionService, RoleResolver, ServiceBuilder, status）
//! - **impls**: 実装（InMemory 系は開発・テスト用、SQLite は feature `sqlite`）
//! - **config**: `taskpool.toml` の読み込み
//! - **observability**: tracing subscriber の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use self::app::{ServiceBuilder, TaskDistributionService};
pub use self::domain::PoolError;
