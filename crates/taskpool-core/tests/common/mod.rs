#![allow(dead_code)]

use std::sync::Arc;

use taskpool_core::app::{ServiceBuilder, TaskDistributionService};
use taskpool_core::domain::{ActorId, CollectionId, ItemFlags, WorkflowItem};
use taskpool_core::impls::{InMemoryDirectory, InMemoryTaskStore, RecordingEventSink};
use taskpool_core::ports::TaskStore;

pub const WF: &str = "wf1";
pub const REVIEW: &str = "review";
pub const APPROVE: &str = "approve";

pub struct Harness {
    pub service: Arc<TaskDistributionService>,
    pub directory: InMemoryDirectory,
    pub events: RecordingEventSink,
}

impl Harness {
    pub fn with_store(store: Arc<dyn TaskStore>) -> Self {
        let directory = InMemoryDirectory::new();
        let events = RecordingEventSink::new();
        let service = ServiceBuilder::new()
            .with_store(store)
            .with_directory(Arc::new(directory.clone()))
            .with_event_sink(Arc::new(events.clone()))
            .build()
            .unwrap();
        Self {
            service: Arc::new(service),
            directory,
            events,
        }
    }

    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemoryTaskStore::new()))
    }

    pub async fn item(&self) -> WorkflowItem {
        self.service
            .register_item(CollectionId::random(), ActorId::random(), ItemFlags::default())
            .await
            .unwrap()
    }
}
