//! MongoDB Event Store
//!
//! This module provides an implementation of the `EventStore` trait with
//! MongoDB as the underlying storage. Events are stored in the configured
//! event collection, one document per event, with a unique index on
//! `(id, source)` for duplicate detection.
//!
//! Under [`StreamConsistencyGuarantee::Transactional`] the current version of
//! every stream is kept in a separate collection and bumped in the same
//! multi-document transaction that inserts the events, which makes batch
//! writes all-or-nothing and conditional writes race-free. Under
//! [`StreamConsistencyGuarantee::None`] the version is derived by counting
//! events and a failing batch may leave the events before the failure behind.
mod document;
mod filter;

use async_stream::stream;
use bson::{doc, Document};
use everstream::{CloudEvent, EventStore, EventStream, WriteCondition};
use futures::stream::{self, StreamExt};
use mongodb::error::{
    ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use mongodb::options::{
    Acknowledgment, FindOptions, IndexOptions, InsertManyOptions, ReadConcern, TransactionOptions,
    WriteConcern,
};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};

use crate::config::{EventStoreConfig, StreamConsistencyGuarantee};
use crate::error::Error;
use async_trait::async_trait;
pub(crate) use document::{from_document, to_document, STREAM_ID, STREAM_ORDER};
use filter::condition_to_filter;

const VERSION: &str = "version";

/// MongoDB event store implementation.
#[derive(Clone)]
pub struct MongoEventStore {
    client: Client,
    db: Database,
    events: Collection<Document>,
    config: EventStoreConfig,
}

impl std::fmt::Debug for MongoEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoEventStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MongoEventStore {
    /// Initializes the indexes required by the store and returns a new
    /// instance of `MongoEventStore`.
    ///
    /// # Arguments
    ///
    /// * `client` - The MongoDB client. Transactions and change streams
    ///   require it to be connected to a replica set.
    /// * `database` - The database holding the event collection.
    /// * `config` - The event store configuration.
    pub async fn try_new(
        client: Client,
        database: &str,
        config: EventStoreConfig,
    ) -> Result<Self, Error> {
        let store = Self::new_uninitialized(client, database, config);
        store.setup().await?;
        Ok(store)
    }

    /// Creates a new instance of `MongoEventStore` without touching the
    /// database.
    ///
    /// The unique index on `(id, source)` and the `(streamId, streamOrder)`
    /// index must already exist; use [`MongoEventStore::try_new`] to create
    /// them.
    pub fn new_uninitialized(client: Client, database: &str, config: EventStoreConfig) -> Self {
        let db = client.database(database);
        let events = db.collection::<Document>(&config.event_collection);
        Self {
            client,
            db,
            events,
            config,
        }
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    async fn setup(&self) -> Result<(), Error> {
        self.events
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "id": 1, "source": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
                None,
            )
            .await?;
        self.events
            .create_index(
                IndexModel::builder()
                    .keys(doc! { STREAM_ID: 1, STREAM_ORDER: 1 })
                    .build(),
                None,
            )
            .await?;
        Ok(())
    }

    fn stream_version_collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }

    fn transaction_options() -> TransactionOptions {
        TransactionOptions::builder()
            .read_concern(ReadConcern::majority())
            .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
            .build()
    }

    /// Commits the in-progress transaction. Returns false when the whole
    /// transaction hit a transient error and should be re-executed.
    async fn commit(session: &mut ClientSession) -> Result<bool, Error> {
        loop {
            match session.commit_transaction().await {
                Ok(()) => return Ok(true),
                Err(error) if error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => continue,
                Err(error) if error.contains_label(TRANSIENT_TRANSACTION_ERROR) => {
                    return Ok(false)
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn write_transactional(
        &self,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
        version_collection: &Collection<Document>,
    ) -> Result<(), Error> {
        let mut session = self.client.start_session(None).await?;
        loop {
            session
                .start_transaction(Self::transaction_options())
                .await?;
            match self
                .insert_versioned_batch(&mut session, stream_id, condition, events, version_collection)
                .await
            {
                Ok(()) => {
                    if Self::commit(&mut session).await? {
                        return Ok(());
                    }
                }
                Err(error) => {
                    let _ = session.abort_transaction().await;
                    if !error.is_transient_transaction_error() {
                        return Err(error);
                    }
                }
            }
        }
    }

    async fn insert_versioned_batch(
        &self,
        session: &mut ClientSession,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
        version_collection: &Collection<Document>,
    ) -> Result<(), Error> {
        let stored_version = version_collection
            .find_one_with_session(doc! { "_id": stream_id }, None, session)
            .await?
            .and_then(|version| version.get_i64(VERSION).ok());
        let current_version = stored_version.unwrap_or(0);

        if let Some(stream_version) = condition.as_stream_version() {
            if !stream_version.matches(&current_version) {
                return Err(Error::WriteConditionNotFulfilled {
                    condition: condition.clone(),
                    actual: current_version,
                });
            }
        }

        let documents: Vec<Document> = events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                to_document(
                    event,
                    stream_id,
                    Some(current_version + 1 + i as i64),
                    self.config.time_representation,
                )
            })
            .collect();
        self.events
            .insert_many_with_session(
                documents,
                InsertManyOptions::builder().ordered(true).build(),
                session,
            )
            .await
            .map_err(classify_insert_error)?;

        let new_version = current_version + events.len() as i64;
        match stored_version {
            // The condition was already verified against version 0; a racing
            // creator surfaces as a write conflict and retries the transaction.
            None => {
                version_collection
                    .insert_one_with_session(
                        doc! { "_id": stream_id, VERSION: new_version },
                        None,
                        session,
                    )
                    .await?;
            }
            Some(_) => {
                // The bump is additionally guarded by the condition translated
                // to a server-side filter, so an interleaving that slipped past
                // the in-process check cannot commit.
                let mut guard = doc! { "_id": stream_id };
                if let Some(stream_version) = condition.as_stream_version() {
                    guard.extend(condition_to_filter(VERSION, stream_version));
                }
                let updated = version_collection
                    .update_one_with_session(
                        guard,
                        doc! { "$set": { VERSION: new_version } },
                        None,
                        session,
                    )
                    .await?;
                if updated.matched_count == 0 {
                    return Err(Error::WriteConditionNotFulfilled {
                        condition: condition.clone(),
                        actual: current_version,
                    });
                }
            }
        }
        Ok(())
    }

    async fn write_unversioned(
        &self,
        stream_id: &str,
        condition: &WriteCondition,
        events: &[CloudEvent],
    ) -> Result<(), Error> {
        if !condition.is_any() {
            return Err(Error::WriteConditionNotSupported);
        }
        let documents: Vec<Document> = events
            .iter()
            .map(|event| to_document(event, stream_id, None, self.config.time_representation))
            .collect();
        // An ordered insert stops at the first duplicate: the documents before
        // it stay persisted, the rest are never attempted.
        self.events
            .insert_many(
                documents,
                InsertManyOptions::builder().ordered(true).build(),
            )
            .await
            .map_err(classify_insert_error)?;
        Ok(())
    }

    async fn read_transactional(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<i64>,
        version_collection: &Collection<Document>,
    ) -> Result<EventStream<'static, Error>, Error> {
        let mut session = self.client.start_session(None).await?;
        loop {
            session
                .start_transaction(Self::transaction_options())
                .await?;
            match self
                .snapshot_stream(&mut session, stream_id, skip, limit, version_collection)
                .await
            {
                Ok((version, events)) => {
                    if Self::commit(&mut session).await? {
                        return Ok(EventStream::new(
                            stream_id,
                            version,
                            stream::iter(events.into_iter().map(Ok)).boxed(),
                        ));
                    }
                }
                Err(error) => {
                    let _ = session.abort_transaction().await;
                    if !error.is_transient_transaction_error() {
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Reads version and events inside one transaction so that they cannot
    /// disagree (no read skew).
    async fn snapshot_stream(
        &self,
        session: &mut ClientSession,
        stream_id: &str,
        skip: u64,
        limit: Option<i64>,
        version_collection: &Collection<Document>,
    ) -> Result<(i64, Vec<CloudEvent>), Error> {
        let version = version_collection
            .find_one_with_session(doc! { "_id": stream_id }, None, session)
            .await?
            .and_then(|version| version.get_i64(VERSION).ok())
            .unwrap_or(0);
        let options = FindOptions::builder()
            .sort(doc! { STREAM_ORDER: 1 })
            .skip(skip)
            .limit(limit)
            .build();
        let mut cursor = self
            .events
            .find_with_session(doc! { STREAM_ID: stream_id }, options, session)
            .await?;
        let mut events = Vec::new();
        while let Some(document) = cursor.next(session).await.transpose()? {
            events.push(from_document(&document, self.config.time_representation)?);
        }
        Ok((version, events))
    }

    async fn read_unversioned(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<i64>,
    ) -> Result<EventStream<'static, Error>, Error> {
        let query = doc! { STREAM_ID: stream_id };
        let version = self.events.count_documents(query.clone(), None).await? as i64;
        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .skip(skip)
            .limit(limit)
            .build();
        let cursor = self.events.find(query, options).await?;
        let time_representation = self.config.time_representation;
        let events = stream! {
            for await document in cursor {
                let document = document?;
                yield from_document(&document, time_representation);
            }
        };
        Ok(EventStream::new(stream_id, version, events.boxed()))
    }
}

#[async_trait]
impl EventStore for MongoEventStore {
    type Error = Error;

    /// Appends `events` to the stream if `condition` holds against its
    /// current version.
    ///
    /// Under the transactional guarantee the version check, the batch insert
    /// and the version bump run in one transaction: either every event is
    /// persisted and the version advances by the batch size, or nothing
    /// changes. Without the guarantee only [`WriteCondition::AnyStreamVersion`]
    /// is accepted and a duplicate inside the batch leaves the events before
    /// it persisted.
    async fn write_conditionally(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> Result<(), Self::Error> {
        if stream_id.is_empty() {
            return Err(Error::InvalidStreamId);
        }
        if events.is_empty() {
            return Ok(());
        }
        match &self.config.consistency {
            StreamConsistencyGuarantee::None => {
                self.write_unversioned(stream_id, &condition, &events).await
            }
            StreamConsistencyGuarantee::Transactional {
                stream_version_collection,
            } => {
                let version_collection = self.stream_version_collection(stream_version_collection);
                self.write_transactional(stream_id, &condition, &events, &version_collection)
                    .await
            }
        }
    }

    /// Reads a slice of the stream in stream order.
    ///
    /// A stream with no events reads as version 0 with an empty event
    /// sequence; it is never an error.
    async fn read_slice(
        &self,
        stream_id: &str,
        skip: u64,
        limit: Option<i64>,
    ) -> Result<EventStream<'static, Self::Error>, Self::Error> {
        if stream_id.is_empty() {
            return Err(Error::InvalidStreamId);
        }
        match &self.config.consistency {
            StreamConsistencyGuarantee::None => self.read_unversioned(stream_id, skip, limit).await,
            StreamConsistencyGuarantee::Transactional {
                stream_version_collection,
            } => {
                let version_collection = self.stream_version_collection(stream_version_collection);
                self.read_transactional(stream_id, skip, limit, &version_collection)
                    .await
            }
        }
    }

    async fn exists(&self, stream_id: &str) -> Result<bool, Self::Error> {
        if stream_id.is_empty() {
            return Err(Error::InvalidStreamId);
        }
        Ok(self
            .events
            .find_one(doc! { STREAM_ID: stream_id }, None)
            .await?
            .is_some())
    }

    /// Removes every event in the stream.
    ///
    /// Under the transactional guarantee the stream version document is kept,
    /// so subsequent writes continue from the previous version. Without it
    /// the derived version drops back to 0.
    async fn delete_all_events_in_event_stream(&self, stream_id: &str) -> Result<(), Self::Error> {
        if stream_id.is_empty() {
            return Err(Error::InvalidStreamId);
        }
        self.events
            .delete_many(doc! { STREAM_ID: stream_id }, None)
            .await?;
        Ok(())
    }

    /// Removes the events and the stream version document.
    async fn delete_event_stream(&self, stream_id: &str) -> Result<(), Self::Error> {
        if stream_id.is_empty() {
            return Err(Error::InvalidStreamId);
        }
        match &self.config.consistency {
            StreamConsistencyGuarantee::None => {
                self.events
                    .delete_many(doc! { STREAM_ID: stream_id }, None)
                    .await?;
                Ok(())
            }
            StreamConsistencyGuarantee::Transactional {
                stream_version_collection,
            } => {
                let version_collection = self.stream_version_collection(stream_version_collection);
                let mut session = self.client.start_session(None).await?;
                loop {
                    session
                        .start_transaction(Self::transaction_options())
                        .await?;
                    let deleted: Result<(), Error> = async {
                        self.events
                            .delete_many_with_session(
                                doc! { STREAM_ID: stream_id },
                                None,
                                &mut session,
                            )
                            .await?;
                        version_collection
                            .delete_one_with_session(doc! { "_id": stream_id }, None, &mut session)
                            .await?;
                        Ok(())
                    }
                    .await;
                    match deleted {
                        Ok(()) => {
                            if Self::commit(&mut session).await? {
                                return Ok(());
                            }
                        }
                        Err(error) => {
                            let _ = session.abort_transaction().await;
                            if !error.is_transient_transaction_error() {
                                return Err(error);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Removes the single event identified by `(id, source)`, leaving a
    /// permanent gap in `streamOrder`. The stream version is not changed.
    async fn delete_event(&self, id: &str, source: &str) -> Result<(), Self::Error> {
        self.events
            .delete_one(doc! { "id": id, "source": source }, None)
            .await?;
        Ok(())
    }
}

/// Maps a failed insert to `DuplicateCloudEvent` when the unique `(id,
/// source)` index rejected a document.
fn classify_insert_error(error: mongodb::error::Error) -> Error {
    if is_duplicate_key_error(&error) {
        Error::DuplicateCloudEvent(error)
    } else {
        Error::Database(error)
    }
}

pub(crate) fn is_duplicate_key_error(error: &mongodb::error::Error) -> bool {
    const DUPLICATE_KEY: i32 = 11000;
    match &*error.kind {
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|error| error.code == DUPLICATE_KEY)),
        ErrorKind::Write(WriteFailure::WriteError(error)) => error.code == DUPLICATE_KEY,
        _ => false,
    }
}
