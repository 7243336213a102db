//! ServiceBuilder - [`TaskDistributionService`] の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 設定ファイルからのストア選択
//!
//! # 使用例
//! ```ignore
//! let service = ServiceBuilder::new()
//!     .with_configured_store(&config)
//!     .await?
//!     .with_directory(Arc::new(directory))
//!     .build()?;
//! ```
//!
//! # Fail-fast 設計
//! - ストアとメンバーシップディレクトリには妥当な既定値がないので必須
//! - どちらかが欠けていれば `build()` が `BuildError::MissingComponent` を返す
//! - Clock / IdGenerator / EventSink はシステム時計・ULID・tracing sink が既定

use std::sync::Arc;

use thiserror::Error;

use super::distribution::TaskDistributionService;
use crate::config::{EngineConfig, StoreKind};
use crate::impls::{InMemoryTaskStore, TracingEventSink};
use crate::ports::{
    Clock, EventSink, IdGenerator, MembershipDirectory, StoreError, SystemClock, TaskStore,
    UlidGenerator,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing component: {0}. Call the matching with_* method before build().")]
    MissingComponent(&'static str),

    #[error("store '{0:?}' is not compiled in; enable the matching cargo feature")]
    UnsupportedStore(StoreKind),

    #[error("failed to open store: {0}")]
    Store(#[from] StoreError),
}

/// ServiceBuilder は [`TaskDistributionService`] を構築
///
/// # 例
/// ```ignore
/// let service = ServiceBuilder::new()
///     .with_store(Arc::new(InMemoryTaskStore::new()))
///     .with_directory(Arc::new(directory))
///     .build()?;
/// ```
#[derive(Default)]
pub struct ServiceBuilder {
    store: Option<Arc<dyn TaskStore>>,
    directory: Option<Arc<dyn MembershipDirectory>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Open the store described by `config`.
    pub async fn with_configured_store(mut self, config: &EngineConfig) -> Result<Self, BuildError> {
        self.store = Some(open_store(config).await?);
        Ok(self)
    }

    pub fn with_directory(mut self, directory: Arc<dyn MembershipDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<TaskDistributionService, BuildError> {
        let store = self.store.ok_or(BuildError::MissingComponent("store"))?;
        let directory = self
            .directory
            .ok_or(BuildError::MissingComponent("membership directory"))?;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(SystemClock)),
        };
        let events: Arc<dyn EventSink> = match self.events {
            Some(events) => events,
            None => Arc::new(TracingEventSink),
        };

        Ok(TaskDistributionService::new(
            store, directory, events, clock, ids,
        ))
    }
}

/// `config.store` で選ばれた [`TaskStore`] を開く
///
/// feature `sqlite` なしで `store = "sqlite"` が指定されたら
/// `BuildError::UnsupportedStore` を返す。
pub async fn open_store(config: &EngineConfig) -> Result<Arc<dyn TaskStore>, BuildError> {
    match config.store {
        StoreKind::Memory => Ok(Arc::new(InMemoryTaskStore::new())),
        #[cfg(feature = "sqlite")]
        StoreKind::Sqlite => {
            let store = crate::impls::SqliteTaskStore::connect(
                &config.database_url,
                config.max_connections,
            )
            .await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StoreKind::Sqlite => Err(BuildError::UnsupportedStore(StoreKind::Sqlite)),
    }
}
