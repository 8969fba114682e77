//! The immutable event envelope persisted per event.
//!
//! A [`CloudEvent`] carries the standard context attributes (`id`, `source`,
//! `type`, `time`, ...) plus an opaque binary payload and free-form extension
//! attributes. The pair `(id, source)` identifies an event globally: stores
//! enforce uniqueness on it and reject duplicates.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Value of a CloudEvent extension attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        ExtensionValue::String(value.to_owned())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        ExtensionValue::String(value)
    }
}

impl From<i64> for ExtensionValue {
    fn from(value: i64) -> Self {
        ExtensionValue::Integer(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        ExtensionValue::Boolean(value)
    }
}

/// An event as supplied by, and returned to, the application.
///
/// Events compare field-wise, so an event read back from a store is equal to
/// the event that was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudEvent {
    id: String,
    source: String,
    ty: String,
    time: Option<DateTime<Utc>>,
    subject: Option<String>,
    data_content_type: Option<String>,
    data_schema: Option<String>,
    data: Option<Vec<u8>>,
    extensions: BTreeMap<String, ExtensionValue>,
}

impl CloudEvent {
    /// Creates an event with the required context attributes. `source` is a
    /// URI reference identifying the producer.
    pub fn new(id: impl Into<String>, source: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            ty: ty.into(),
            time: None,
            subject: None,
            data_content_type: None,
            data_schema: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attaches a binary payload together with its content type.
    pub fn with_data(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.data_content_type = Some(content_type.into());
        self.data = Some(data);
        self
    }

    pub fn with_data_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    pub fn with_extension(
        mut self,
        name: impl Into<String>,
        value: impl Into<ExtensionValue>,
    ) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn time(&self) -> Option<&DateTime<Utc>> {
        self.time.as_ref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn data_content_type(&self) -> Option<&str> {
        self.data_content_type.as_deref()
    }

    pub fn data_schema(&self) -> Option<&str> {
        self.data_schema.as_deref()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn extensions(&self) -> &BTreeMap<String, ExtensionValue> {
        &self.extensions
    }
}
