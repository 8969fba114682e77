//! # MongoDB Everstream Backend Library
//!
//! The event store persists CloudEvents as documents in an event collection,
//! optionally maintaining a per-stream version inside multi-document
//! transactions. The subscription models turn the event collection's change
//! stream into durable, resumable, retry-wrapped event delivery, with an
//! optional lease-based competing-consumer layer for running replicas.
mod config;
mod error;
mod event_store;
mod subscription;

pub use crate::config::{EventStoreConfig, StreamConsistencyGuarantee, TimeRepresentation};
pub use crate::error::Error;
pub use crate::event_store::MongoEventStore;
pub use crate::subscription::{
    ActionError, CompetingConsumerSubscriptionModel, DurableMongoSubscriptionModel, EventAction,
    MongoLeaseCompetingConsumerStrategy, MongoSubscriptionModel, MongoSubscriptionPositionStorage,
    PositionAwareCloudEvent, StartAt, Subscription, SubscriptionFilter, SubscriptionPosition,
};
