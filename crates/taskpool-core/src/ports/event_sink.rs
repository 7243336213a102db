//! EventSink port - コミット後のドメインイベント送信先
//!
//! 送信は best effort です。失敗してもコミット済みの変更は巻き戻しません。

use async_trait::async_trait;

use crate::domain::DomainEvent;

/// Receives domain events. Emission is best effort: a sink cannot fail the
/// operation that produced the event, which has already committed.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: DomainEvent);
}
