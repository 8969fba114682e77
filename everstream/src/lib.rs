//! Core building blocks for an append-only CloudEvents event store.
//!
//! This crate defines the storage-agnostic pieces: the [`CloudEvent`] envelope,
//! the [`Condition`] algebra used by conditional writes, the [`EventStore`]
//! trait together with [`EventStream`], and the [`RetryStrategy`] applied
//! around subscription delivery. Storage backends live in sibling crates.
pub mod cloud_event;
pub mod condition;
mod event_store;
pub mod retry;
mod stream;
mod write_condition;

pub use crate::cloud_event::{CloudEvent, ExtensionValue};
pub use crate::condition::Condition;
pub use crate::event_store::EventStore;
pub use crate::retry::{Backoff, RetryStrategy};
pub use crate::stream::EventStream;
pub use crate::write_condition::WriteCondition;
