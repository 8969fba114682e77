//! Event store configuration.
//!
//! [`TimeRepresentation`] must be the same for every component that reads or
//! writes the event collection: the store that persists the `time` attribute
//! and the subscription models that decode it.

/// How the CloudEvent `time` attribute is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRepresentation {
    /// Persist as an RFC 3339 string. Keeps full timestamp precision but the
    /// field cannot be range-queried as a date.
    Rfc3339String,
    /// Persist as a BSON datetime. Range-queryable, millisecond precision.
    Date,
}

/// How stream consistency is maintained by the event store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamConsistencyGuarantee {
    /// No version bookkeeping: the stream version is derived by counting
    /// events, batch writes are not isolated, and write conditions are not
    /// supported.
    None,
    /// A stream version document is maintained in `stream_version_collection`
    /// and updated in the same transaction as the event insert. Batch writes
    /// are all-or-nothing and reads are free of read skew.
    Transactional { stream_version_collection: String },
}

impl StreamConsistencyGuarantee {
    pub fn none() -> Self {
        StreamConsistencyGuarantee::None
    }

    pub fn transactional(stream_version_collection: impl Into<String>) -> Self {
        StreamConsistencyGuarantee::Transactional {
            stream_version_collection: stream_version_collection.into(),
        }
    }
}

/// Configuration of a [`MongoEventStore`](crate::MongoEventStore).
#[derive(Debug, Clone, PartialEq)]
pub struct EventStoreConfig {
    pub(crate) event_collection: String,
    pub(crate) consistency: StreamConsistencyGuarantee,
    pub(crate) time_representation: TimeRepresentation,
}

impl EventStoreConfig {
    /// Creates a configuration persisting events to `event_collection`, with
    /// no consistency guarantee and RFC 3339 times.
    pub fn new(event_collection: impl Into<String>) -> Self {
        Self {
            event_collection: event_collection.into(),
            consistency: StreamConsistencyGuarantee::None,
            time_representation: TimeRepresentation::Rfc3339String,
        }
    }

    pub fn with_consistency(mut self, consistency: StreamConsistencyGuarantee) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_time_representation(mut self, time_representation: TimeRepresentation) -> Self {
        self.time_representation = time_representation;
        self
    }

    pub fn event_collection(&self) -> &str {
        &self.event_collection
    }

    pub fn consistency(&self) -> &StreamConsistencyGuarantee {
        &self.consistency
    }

    pub fn time_representation(&self) -> TimeRepresentation {
        self.time_representation
    }
}
