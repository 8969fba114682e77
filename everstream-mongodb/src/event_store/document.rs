//! Mapping between [`CloudEvent`]s and the documents stored in the event
//! collection.
//!
//! One document per event: the CloudEvent context attributes are flattened to
//! top-level fields, the payload is stored as binary, extensions as an
//! embedded document. The stream id is denormalized onto every document and,
//! under the transactional guarantee, the 1-based position of the event in
//! its stream is stored as `streamOrder`.
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use chrono::{DateTime, SecondsFormat, Utc};
use everstream::{CloudEvent, ExtensionValue};

use crate::config::TimeRepresentation;
use crate::error::Error;

pub(crate) const STREAM_ID: &str = "streamId";
pub(crate) const STREAM_ORDER: &str = "streamOrder";

pub(crate) fn to_document(
    event: &CloudEvent,
    stream_id: &str,
    stream_order: Option<i64>,
    time_representation: TimeRepresentation,
) -> Document {
    let mut document = doc! {
        STREAM_ID: stream_id,
        "id": event.id(),
        "source": event.source(),
        "type": event.ty(),
    };
    if let Some(stream_order) = stream_order {
        document.insert(STREAM_ORDER, stream_order);
    }
    if let Some(time) = event.time() {
        let time = match time_representation {
            TimeRepresentation::Rfc3339String => {
                Bson::String(time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            TimeRepresentation::Date => Bson::DateTime(bson::DateTime::from_chrono(*time)),
        };
        document.insert("time", time);
    }
    if let Some(subject) = event.subject() {
        document.insert("subject", subject);
    }
    if let Some(content_type) = event.data_content_type() {
        document.insert("datacontenttype", content_type);
    }
    if let Some(schema) = event.data_schema() {
        document.insert("dataschema", schema);
    }
    if let Some(data) = event.data() {
        document.insert(
            "data",
            Binary {
                subtype: BinarySubtype::Generic,
                bytes: data.to_vec(),
            },
        );
    }
    if !event.extensions().is_empty() {
        let extensions: Document = event
            .extensions()
            .iter()
            .map(|(name, value)| (name.clone(), extension_to_bson(value)))
            .collect();
        document.insert("extensions", extensions);
    }
    document
}

pub(crate) fn from_document(
    document: &Document,
    time_representation: TimeRepresentation,
) -> Result<CloudEvent, Error> {
    let id = required_str(document, "id")?;
    let source = required_str(document, "source")?;
    let ty = required_str(document, "type")?;
    let mut event = CloudEvent::new(id, source, ty);
    if let Some(time) = document.get("time") {
        event = event.with_time(time_from_bson(time, time_representation)?);
    }
    if let Some(Bson::String(subject)) = document.get("subject") {
        event = event.with_subject(subject.clone());
    }
    if let Some(Bson::String(schema)) = document.get("dataschema") {
        event = event.with_data_schema(schema.clone());
    }
    if let Some(Bson::Binary(data)) = document.get("data") {
        let content_type = match document.get("datacontenttype") {
            Some(Bson::String(content_type)) => content_type.clone(),
            _ => "application/octet-stream".to_owned(),
        };
        event = event.with_data(content_type, data.bytes.clone());
    }
    if let Some(Bson::Document(extensions)) = document.get("extensions") {
        for (name, value) in extensions {
            event = event.with_extension(name.clone(), extension_from_bson(name, value)?);
        }
    }
    Ok(event)
}

fn required_str<'a>(document: &'a Document, field: &str) -> Result<&'a str, Error> {
    document
        .get_str(field)
        .map_err(|_| Error::Document(format!("event document is missing the {field} attribute")))
}

fn time_from_bson(
    time: &Bson,
    time_representation: TimeRepresentation,
) -> Result<DateTime<Utc>, Error> {
    match (time_representation, time) {
        (TimeRepresentation::Rfc3339String, Bson::String(time)) => {
            DateTime::parse_from_rfc3339(time)
                .map(|time| time.with_timezone(&Utc))
                .map_err(|_| Error::Document(format!("time is not a valid RFC 3339 string: {time}")))
        }
        (TimeRepresentation::Date, Bson::DateTime(time)) => Ok(time.to_chrono()),
        (_, other) => Err(Error::Document(format!(
            "time has an unexpected representation: {other}"
        ))),
    }
}

fn extension_to_bson(value: &ExtensionValue) -> Bson {
    match value {
        ExtensionValue::String(value) => Bson::String(value.clone()),
        ExtensionValue::Integer(value) => Bson::Int64(*value),
        ExtensionValue::Boolean(value) => Bson::Boolean(*value),
    }
}

fn extension_from_bson(name: &str, value: &Bson) -> Result<ExtensionValue, Error> {
    match value {
        Bson::String(value) => Ok(ExtensionValue::String(value.clone())),
        Bson::Int64(value) => Ok(ExtensionValue::Integer(*value)),
        Bson::Int32(value) => Ok(ExtensionValue::Integer(i64::from(*value))),
        Bson::Boolean(value) => Ok(ExtensionValue::Boolean(*value)),
        other => Err(Error::Document(format!(
            "extension {name} has an unsupported type: {other}"
        ))),
    }
}
