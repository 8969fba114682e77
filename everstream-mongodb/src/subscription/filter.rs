//! Server-side filtering of the change feed.
use bson::{doc, Document};

/// Criteria limiting which events a subscription observes.
///
/// The criteria are matched server-side against the inserted event document,
/// so filtered-out events are never shipped to the subscriber. Positions still
/// advance only past delivered events.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionFilter {
    criteria: Document,
}

impl SubscriptionFilter {
    /// Only events belonging to the given stream.
    pub fn stream_id_equals(stream_id: &str) -> Self {
        Self::matching(doc! { "fullDocument.streamId": stream_id })
    }

    /// Only events with the given CloudEvent `type`.
    pub fn type_equals(ty: &str) -> Self {
        Self::matching(doc! { "fullDocument.type": ty })
    }

    /// Only events with the given CloudEvent `source`.
    pub fn source_equals(source: &str) -> Self {
        Self::matching(doc! { "fullDocument.source": source })
    }

    /// Only events with the given CloudEvent `subject`.
    pub fn subject_equals(subject: &str) -> Self {
        Self::matching(doc! { "fullDocument.subject": subject })
    }

    /// Arbitrary match criteria over the change-stream document. Event
    /// attributes live under `fullDocument`.
    pub fn matching(criteria: Document) -> Self {
        Self { criteria }
    }

    /// Both filters must match.
    pub fn and(self, other: SubscriptionFilter) -> Self {
        Self {
            criteria: doc! { "$and": [self.criteria, other.criteria] },
        }
    }

    pub(crate) fn criteria(&self) -> &Document {
        &self.criteria
    }
}
