//! A read of an event stream: the version paired with the events.
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::cloud_event::CloudEvent;

/// The result of reading an event stream.
///
/// `version` is the stream version at the time of the read; `events` yields
/// the requested slice lazily, in stream order. A stream that does not exist
/// reads as version 0 with no events.
pub struct EventStream<'a, E> {
    id: String,
    version: i64,
    events: BoxStream<'a, Result<CloudEvent, E>>,
}

impl<'a, E> EventStream<'a, E> {
    pub fn new(
        id: impl Into<String>,
        version: i64,
        events: BoxStream<'a, Result<CloudEvent, E>>,
    ) -> Self {
        Self {
            id: id.into(),
            version,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Consumes the stream, yielding the events.
    pub fn events(self) -> BoxStream<'a, Result<CloudEvent, E>> {
        self.events
    }

    /// Materializes the remaining events.
    pub async fn collect(self) -> Result<Vec<CloudEvent>, E> {
        self.events.try_collect().await
    }
}

impl<E> std::fmt::Debug for EventStream<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
