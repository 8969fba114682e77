//! Positions in the change feed and the start position of a subscription.
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bson::{Bson, Timestamp};
use everstream::CloudEvent;
use futures::future::BoxFuture;
use mongodb::change_stream::event::ResumeToken;

use crate::error::Error;

/// An opaque, persistable position in the event collection's change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionPosition {
    /// The change stream's own cursor for an observed event.
    ResumeToken(Bson),
    /// A logical server timestamp; used for "now" starts before any event has
    /// been observed.
    OperationTime(Timestamp),
}

/// Supplier re-evaluated every time a [`StartAt::Dynamic`] is resolved.
pub type StartAtSupplier = Arc<dyn Fn() -> BoxFuture<'static, StartAt> + Send + Sync>;

/// Specifies at which position a subscription starts when it is subscribed or
/// resumed.
#[derive(Clone)]
pub enum StartAt {
    /// Start at the server's current operation time.
    Now,
    /// Let the subscription model decide. A durable model resolves this to the
    /// stored position; the base model treats it as [`StartAt::Now`].
    Default,
    /// Start at the given position.
    Position(SubscriptionPosition),
    /// Resolved again on every subscribe and resume, so that a position stored
    /// while the subscription was paused is honored.
    Dynamic(StartAtSupplier),
}

impl StartAt {
    pub fn now() -> Self {
        StartAt::Now
    }

    pub fn subscription_model_default() -> Self {
        StartAt::Default
    }

    pub fn position(position: SubscriptionPosition) -> Self {
        StartAt::Position(position)
    }

    pub fn dynamic(
        supplier: impl Fn() -> BoxFuture<'static, StartAt> + Send + Sync + 'static,
    ) -> Self {
        StartAt::Dynamic(Arc::new(supplier))
    }

    /// Resolves nested `Dynamic` start positions until a concrete one remains.
    pub(crate) async fn resolve(self) -> ResolvedStartAt {
        let mut current = self;
        loop {
            match current {
                StartAt::Now | StartAt::Default => return ResolvedStartAt::Now,
                StartAt::Position(position) => return ResolvedStartAt::Position(position),
                StartAt::Dynamic(supplier) => current = supplier().await,
            }
        }
    }
}

impl fmt::Debug for StartAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartAt::Now => f.write_str("Now"),
            StartAt::Default => f.write_str("Default"),
            StartAt::Position(position) => f.debug_tuple("Position").field(position).finish(),
            StartAt::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A start position with every indirection resolved.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedStartAt {
    Now,
    Position(SubscriptionPosition),
}

/// A cloud event together with the change-feed position it was observed at.
///
/// Derefs to the wrapped [`CloudEvent`].
#[derive(Debug, Clone)]
pub struct PositionAwareCloudEvent {
    cloud_event: CloudEvent,
    position: SubscriptionPosition,
}

impl PositionAwareCloudEvent {
    pub fn new(cloud_event: CloudEvent, position: SubscriptionPosition) -> Self {
        Self {
            cloud_event,
            position,
        }
    }

    pub fn position(&self) -> &SubscriptionPosition {
        &self.position
    }

    pub fn into_inner(self) -> CloudEvent {
        self.cloud_event
    }
}

impl Deref for PositionAwareCloudEvent {
    type Target = CloudEvent;

    fn deref(&self) -> &Self::Target {
        &self.cloud_event
    }
}

pub(crate) fn resume_token_to_bson(token: &ResumeToken) -> Result<Bson, Error> {
    bson::to_bson(token)
        .map_err(|error| Error::Document(format!("resume token is not serializable: {error}")))
}

pub(crate) fn bson_to_resume_token(token: &Bson) -> Result<ResumeToken, Error> {
    bson::from_bson(token.clone())
        .map_err(|error| Error::Document(format!("stored resume token is malformed: {error}")))
}
