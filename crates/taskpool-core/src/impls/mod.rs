//! Impls - adapters for the ports.
//!
//! - **InMemoryTaskStore**: the whole store behind one async mutex
//! - **SqliteTaskStore** (feature `sqlite`): sqlx-backed durable store
//! - **InMemoryDirectory**: nested-group membership kept in memory
//! - **TracingEventSink** / **RecordingEventSink** / **NoopEventSink**

pub mod event_sink;
pub mod inmem_directory;
pub mod inmem_store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use self::event_sink::{NoopEventSink, RecordingEventSink, TracingEventSink};
pub use self::inmem_directory::InMemoryDirectory;
pub use self::inmem_store::InMemoryTaskStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite_store::SqliteTaskStore;
