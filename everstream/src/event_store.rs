//! Event store is responsible for persisting and retrieving event streams.
//!
//! Implementations are backed by a concrete database and decide how the
//! stream version is maintained. All operations are stream-scoped: events
//! belong to exactly one stream and are totally ordered within it.
use async_trait::async_trait;

use crate::cloud_event::CloudEvent;
use crate::stream::EventStream;
use crate::write_condition::WriteCondition;

/// An append-only, stream-scoped event store.
#[async_trait]
pub trait EventStore {
    type Error: Send + Sync + 'static;

    /// Appends `events` to the stream without any version requirement.
    async fn write(&self, stream_id: &str, events: Vec<CloudEvent>) -> Result<(), Self::Error> {
        self.write_conditionally(stream_id, WriteCondition::any(), events)
            .await
    }

    /// Appends `events` to the stream, provided `condition` holds against the
    /// current stream version. The batch keeps its order; an empty batch is a
    /// no-op.
    async fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> Result<(), Self::Error>;

    /// Reads the whole stream.
    async fn read(&self, stream_id: &str) -> Result<EventStream<'static, Self::Error>, Self::Error> {
        self.read_slice(stream_id, 0, None).await
    }

    /// Reads a slice of the stream, skipping the first `skip` events and
    /// yielding at most `limit` of the rest. The returned version is always
    /// the version of the whole stream.
    async fn read_slice(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<i64>,
    ) -> Result<EventStream<'static, Self::Error>, Self::Error>;

    /// Returns whether at least one event exists for the stream.
    async fn exists(&self, stream_id: &str) -> Result<bool, Self::Error>;

    /// Removes every event in the stream. Whether the stream version survives
    /// depends on how the implementation maintains it.
    async fn delete_all_events_in_event_stream(&self, stream_id: &str) -> Result<(), Self::Error>;

    /// Removes the stream entirely: its events and any version bookkeeping.
    async fn delete_event_stream(&self, stream_id: &str) -> Result<(), Self::Error>;

    /// Removes the single event identified by `(id, source)`. The stream
    /// version is left untouched.
    async fn delete_event(&self, id: &str, source: &str) -> Result<(), Self::Error>;
}
