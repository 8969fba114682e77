//! MongoDB Change-Stream Subscription Models
//!
//! [`MongoSubscriptionModel`] turns the event collection's change stream into
//! per-subscription delivery of [`PositionAwareCloudEvent`]s, with lifecycle
//! control (pause, resume, cancel, stop, start, shutdown) and retry-wrapped
//! actions. It does not remember positions across restarts;
//! [`DurableMongoSubscriptionModel`] adds that, and
//! [`CompetingConsumerSubscriptionModel`] adds lease-based mutual exclusion
//! across replicas. Delivery is at least once: actions must be idempotent.
mod competing;
mod durable;
mod filter;
mod lease;
mod position;
mod position_storage;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document, Timestamp};
use everstream::RetryStrategy;
use futures::StreamExt;
use mongodb::change_stream::event::OperationType;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{Collection, Database};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TimeRepresentation;
use crate::error::Error;
use crate::event_store::from_document;

pub use competing::CompetingConsumerSubscriptionModel;
pub use durable::DurableMongoSubscriptionModel;
pub use filter::SubscriptionFilter;
pub use lease::MongoLeaseCompetingConsumerStrategy;
pub use position::{PositionAwareCloudEvent, StartAt, SubscriptionPosition};
pub use position_storage::MongoSubscriptionPositionStorage;

use position::{bson_to_resume_token, resume_token_to_bson, ResolvedStartAt};

/// Error raised by an [`EventAction`].
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// The action invoked for every event a subscription observes.
///
/// Actions for the same subscription id are invoked serially, in change-feed
/// order. Delivery is at least once, so actions must tolerate re-delivery of
/// an event they have already handled.
#[async_trait]
pub trait EventAction: Send + Sync {
    async fn handle(&self, event: PositionAwareCloudEvent) -> Result<(), ActionError>;
}

#[async_trait]
impl<F, Fut> EventAction for F
where
    F: Fn(PositionAwareCloudEvent) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ActionError>> + Send + 'static,
{
    async fn handle(&self, event: PositionAwareCloudEvent) -> Result<(), ActionError> {
        (self)(event).await
    }
}

/// Wraps an action error so the retry strategy can inspect it.
#[derive(Debug)]
struct HandlerError(ActionError);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Handle to a registered subscription.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    started: watch::Receiver<bool>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits until the subscription's change stream is open and delivering,
    /// returning whether that happened within `timeout`.
    pub async fn wait_until_started(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.started.wait_for(|started| *started))
            .await
            .map(|started| started.is_ok())
            .unwrap_or(false)
    }
}

#[derive(Clone)]
struct SubscriptionRequest {
    id: String,
    filter: Option<SubscriptionFilter>,
    start_at: StartAt,
    action: Arc<dyn EventAction>,
}

struct ActiveSubscription {
    request: SubscriptionRequest,
    started: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

struct PausedSubscription {
    request: SubscriptionRequest,
    started: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct ModelState {
    running: HashMap<String, ActiveSubscription>,
    paused: HashMap<String, PausedSubscription>,
    stopped: bool,
    shutdown: bool,
}

/// Subscription model consuming the change stream of the event collection.
///
/// Start positions are resolved per subscribe/resume; the model itself treats
/// [`StartAt::Default`] as [`StartAt::Now`]. The `running` and `paused`
/// registries are only written through the lifecycle API, serialized by an
/// internal mutex.
pub struct MongoSubscriptionModel {
    db: Database,
    events: Collection<Document>,
    time_representation: TimeRepresentation,
    retry_strategy: RetryStrategy,
    restart_on_change_stream_history_lost: bool,
    shutdown_token: CancellationToken,
    state: Mutex<ModelState>,
}

impl MongoSubscriptionModel {
    /// Creates a subscription model over `event_collection`.
    ///
    /// `time_representation` must match the event store that writes the
    /// collection. Actions are retried with exponential backoff from 100 ms up
    /// to 2 s by default.
    pub fn new(db: Database, event_collection: &str, time_representation: TimeRepresentation) -> Self {
        let events = db.collection::<Document>(event_collection);
        Self {
            db,
            events,
            time_representation,
            retry_strategy: RetryStrategy::exponential(
                Duration::from_millis(100),
                Duration::from_secs(2),
                2.0,
            ),
            restart_on_change_stream_history_lost: true,
            shutdown_token: CancellationToken::new(),
            state: Mutex::new(ModelState::default()),
        }
    }

    /// Sets the retry strategy applied to every action invocation.
    pub fn with_retry_strategy(mut self, retry_strategy: RetryStrategy) -> Self {
        self.retry_strategy = retry_strategy;
        self
    }

    /// Controls what happens when the change stream has lost the history
    /// needed to resume: restart from "now" (the default) or stop the
    /// subscription.
    pub fn with_restart_on_change_stream_history_lost(mut self, restart: bool) -> Self {
        self.restart_on_change_stream_history_lost = restart;
        self
    }

    /// Registers and starts a subscription.
    pub fn subscribe(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        action: impl EventAction + 'static,
    ) -> Result<Subscription, Error> {
        self.register(subscription_id, filter, start_at, Arc::new(action), false)
    }

    /// Registers a subscription without starting it; it starts on
    /// [`resume_subscription`](Self::resume_subscription).
    pub fn subscribe_paused(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        action: impl EventAction + 'static,
    ) -> Result<Subscription, Error> {
        self.register(subscription_id, filter, start_at, Arc::new(action), true)
    }

    fn register(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        action: Arc<dyn EventAction>,
        paused: bool,
    ) -> Result<Subscription, Error> {
        let mut state = self.lock_state();
        if state.shutdown {
            return Err(Error::ModelShutDown);
        }
        if state.running.contains_key(subscription_id) || state.paused.contains_key(subscription_id)
        {
            return Err(Error::SubscriptionAlreadyExists(subscription_id.to_owned()));
        }
        let request = SubscriptionRequest {
            id: subscription_id.to_owned(),
            filter,
            start_at,
            action,
        };
        let started = Arc::new(watch::channel(false).0);
        let subscription = Subscription {
            id: subscription_id.to_owned(),
            started: started.subscribe(),
        };
        if paused || state.stopped {
            state.paused.insert(
                subscription_id.to_owned(),
                PausedSubscription { request, started },
            );
        } else {
            let active = self.spawn_worker(request, started);
            state.running.insert(subscription_id.to_owned(), active);
        }
        Ok(subscription)
    }

    /// Cancels the subscription. Unknown subscription ids are a no-op.
    pub fn cancel_subscription(&self, subscription_id: &str) {
        let mut state = self.lock_state();
        if let Some(active) = state.running.remove(subscription_id) {
            active.cancel.cancel();
        }
        state.paused.remove(subscription_id);
    }

    /// Pauses a running subscription. The in-flight action, if any, completes;
    /// no further events are delivered until the subscription is resumed.
    pub fn pause_subscription(&self, subscription_id: &str) -> Result<(), Error> {
        let mut state = self.lock_state();
        if state.shutdown {
            return Err(Error::ModelShutDown);
        }
        let Some(active) = state.running.remove(subscription_id) else {
            return Err(Error::SubscriptionNotRunning(subscription_id.to_owned()));
        };
        active.cancel.cancel();
        let _ = active.started.send(false);
        state.paused.insert(
            subscription_id.to_owned(),
            PausedSubscription {
                request: active.request,
                started: active.started,
            },
        );
        Ok(())
    }

    /// Resumes a paused subscription, re-resolving its start position.
    pub fn resume_subscription(&self, subscription_id: &str) -> Result<Subscription, Error> {
        let mut state = self.lock_state();
        if state.shutdown {
            return Err(Error::ModelShutDown);
        }
        let Some(paused) = state.paused.remove(subscription_id) else {
            return Err(Error::SubscriptionNotPaused(subscription_id.to_owned()));
        };
        let active = self.spawn_worker(paused.request, paused.started);
        let subscription = Subscription {
            id: subscription_id.to_owned(),
            started: active.started.subscribe(),
        };
        state.running.insert(subscription_id.to_owned(), active);
        Ok(subscription)
    }

    /// Resumes every paused subscription. A no-op on a model that is already
    /// running.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.lock_state();
        if state.shutdown {
            return Err(Error::ModelShutDown);
        }
        if !state.stopped {
            return Ok(());
        }
        state.stopped = false;
        let paused: Vec<String> = state.paused.keys().cloned().collect();
        for subscription_id in paused {
            if let Some(paused) = state.paused.remove(&subscription_id) {
                let active = self.spawn_worker(paused.request, paused.started);
                state.running.insert(subscription_id, active);
            }
        }
        Ok(())
    }

    /// Pauses every running subscription and stops delivering until
    /// [`start`](Self::start).
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if state.shutdown {
            return;
        }
        state.stopped = true;
        let running: Vec<String> = state.running.keys().cloned().collect();
        for subscription_id in running {
            if let Some(active) = state.running.remove(&subscription_id) {
                active.cancel.cancel();
                let _ = active.started.send(false);
                state.paused.insert(
                    subscription_id,
                    PausedSubscription {
                        request: active.request,
                        started: active.started,
                    },
                );
            }
        }
    }

    /// Shuts the model down. In-flight actions complete but are not retried;
    /// the model cannot be started again.
    pub async fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = {
            let mut state = self.lock_state();
            state.shutdown = true;
            state.paused.clear();
            state
                .running
                .drain()
                .map(|(_, active)| active.worker)
                .collect()
        };
        self.shutdown_token.cancel();
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub fn is_subscription_running(&self, subscription_id: &str) -> bool {
        let state = self.lock_state();
        !state.shutdown && state.running.contains_key(subscription_id)
    }

    pub fn is_subscription_paused(&self, subscription_id: &str) -> bool {
        let state = self.lock_state();
        !state.shutdown && state.paused.contains_key(subscription_id)
    }

    pub fn is_running(&self) -> bool {
        let state = self.lock_state();
        !state.shutdown && !state.stopped
    }

    /// A handle to an already-registered subscription.
    pub fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        let state = self.lock_state();
        let started = state
            .running
            .get(subscription_id)
            .map(|active| &active.started)
            .or_else(|| {
                state
                    .paused
                    .get(subscription_id)
                    .map(|paused| &paused.started)
            })?;
        Some(Subscription {
            id: subscription_id.to_owned(),
            started: started.subscribe(),
        })
    }

    /// The position a subscription of this model would start at "now":
    /// the server's operation time with the increment advanced by one, so
    /// that a replay can never re-deliver an event persisted just before.
    pub async fn global_subscription_position(&self) -> Result<SubscriptionPosition, Error> {
        let operation_time = current_operation_time(&self.db).await?;
        Ok(SubscriptionPosition::OperationTime(operation_time))
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(
        &self,
        request: SubscriptionRequest,
        started: Arc<watch::Sender<bool>>,
    ) -> ActiveSubscription {
        let cancel = self.shutdown_token.child_token();
        let context = WorkerContext {
            db: self.db.clone(),
            events: self.events.clone(),
            time_representation: self.time_representation,
            retry_strategy: self.retry_strategy.clone(),
            restart_on_change_stream_history_lost: self.restart_on_change_stream_history_lost,
            request: request.clone(),
            started: Arc::clone(&started),
            cancel: cancel.clone(),
        };
        let worker = tokio::spawn(run_subscription(context));
        ActiveSubscription {
            request,
            started,
            cancel,
            worker,
        }
    }
}

impl fmt::Debug for MongoSubscriptionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoSubscriptionModel")
            .field("event_collection", &self.events.name())
            .field("time_representation", &self.time_representation)
            .finish_non_exhaustive()
    }
}

struct WorkerContext {
    db: Database,
    events: Collection<Document>,
    time_representation: TimeRepresentation,
    retry_strategy: RetryStrategy,
    restart_on_change_stream_history_lost: bool,
    request: SubscriptionRequest,
    started: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

async fn run_subscription(ctx: WorkerContext) {
    let subscription_id = ctx.request.id.clone();
    let mut start_at = ctx.request.start_at.clone().resolve().await;
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        let options = match change_stream_options(&ctx.db, &start_at).await {
            Ok(options) => options,
            Err(error) => {
                tracing::error!(%subscription_id, %error, "failed to resolve the start position");
                return;
            }
        };
        let pipeline = change_stream_pipeline(ctx.request.filter.as_ref());
        let mut change_stream = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = ctx.events.watch(pipeline, options) => match result {
                Ok(change_stream) => change_stream,
                Err(error) if is_history_lost(&error) => {
                    if !ctx.restart_on_change_stream_history_lost {
                        let error = Error::CatchupImpossible(subscription_id.clone());
                        tracing::error!(%subscription_id, %error, "stopping subscription");
                        return;
                    }
                    tracing::warn!(%subscription_id, "change stream history lost, restarting from now");
                    start_at = ResolvedStartAt::Now;
                    continue;
                }
                Err(error) => {
                    tracing::error!(%subscription_id, %error, "failed to open the change stream");
                    return;
                }
            },
        };
        let _ = ctx.started.send(true);
        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                next = change_stream.next() => next,
            };
            match next {
                None => {
                    tracing::debug!(%subscription_id, "change stream closed");
                    return;
                }
                Some(Err(error)) if is_history_lost(&error) => {
                    if !ctx.restart_on_change_stream_history_lost {
                        let error = Error::CatchupImpossible(subscription_id.clone());
                        tracing::error!(%subscription_id, %error, "stopping subscription");
                        return;
                    }
                    tracing::warn!(%subscription_id, "change stream history lost, restarting from now");
                    start_at = ResolvedStartAt::Now;
                    break;
                }
                Some(Err(error)) => {
                    tracing::error!(%subscription_id, %error, "change stream failed");
                    return;
                }
                Some(Ok(change)) => {
                    if change.operation_type != OperationType::Insert {
                        continue;
                    }
                    let Some(document) = change.full_document else {
                        continue;
                    };
                    let position = match resume_token_to_bson(&change.id) {
                        Ok(token) => SubscriptionPosition::ResumeToken(token),
                        Err(error) => {
                            tracing::error!(%subscription_id, %error, "stopping subscription");
                            return;
                        }
                    };
                    let cloud_event = match from_document(&document, ctx.time_representation) {
                        Ok(cloud_event) => cloud_event,
                        Err(error) => {
                            tracing::error!(%subscription_id, %error, "skipping malformed event document");
                            continue;
                        }
                    };
                    let event = PositionAwareCloudEvent::new(cloud_event, position);
                    let action = Arc::clone(&ctx.request.action);
                    let delivered = ctx
                        .retry_strategy
                        .execute(
                            || !ctx.cancel.is_cancelled(),
                            || {
                                let event = event.clone();
                                let action = Arc::clone(&action);
                                async move { action.handle(event).await.map_err(HandlerError) }
                            },
                        )
                        .await;
                    if let Err(error) = delivered {
                        if ctx.cancel.is_cancelled() {
                            return;
                        }
                        // Continuing would let later positions be persisted
                        // past the failed event, losing it forever.
                        tracing::error!(%subscription_id, %error, "action failed after retries were exhausted, stopping subscription");
                        return;
                    }
                }
            }
        }
    }
}

async fn change_stream_options(
    db: &Database,
    start_at: &ResolvedStartAt,
) -> Result<ChangeStreamOptions, Error> {
    let builder =
        ChangeStreamOptions::builder().full_document(Some(FullDocumentType::UpdateLookup));
    let options = match start_at {
        ResolvedStartAt::Now => {
            let operation_time = current_operation_time(db).await?;
            builder
                .start_at_operation_time(Some(operation_time))
                .build()
        }
        ResolvedStartAt::Position(SubscriptionPosition::ResumeToken(token)) => builder
            .resume_after(Some(bson_to_resume_token(token)?))
            .build(),
        ResolvedStartAt::Position(SubscriptionPosition::OperationTime(operation_time)) => builder
            .start_at_operation_time(Some(*operation_time))
            .build(),
    };
    Ok(options)
}

fn change_stream_pipeline(filter: Option<&SubscriptionFilter>) -> Vec<Document> {
    let mut criteria = doc! { "operationType": "insert" };
    if let Some(filter) = filter {
        criteria.extend(filter.criteria().clone());
    }
    vec![doc! { "$match": criteria }]
}

fn is_history_lost(error: &mongodb::error::Error) -> bool {
    const CHANGE_STREAM_HISTORY_LOST: i32 = 286;
    matches!(
        &*error.kind,
        mongodb::error::ErrorKind::Command(command_error)
            if command_error.code == CHANGE_STREAM_HISTORY_LOST
    )
}

/// Asks the server for its current operation time, advanced by one increment
/// so that a subscription starting here never replays an event that was
/// persisted in the same logical instant.
pub(crate) async fn current_operation_time(db: &Database) -> Result<Timestamp, Error> {
    let response = db.run_command(doc! { "hello": 1 }, None).await?;
    let operation_time = match response.get("operationTime") {
        Some(Bson::Timestamp(operation_time)) => *operation_time,
        _ => match response
            .get_document("$clusterTime")
            .ok()
            .and_then(|cluster_time| cluster_time.get("clusterTime"))
        {
            Some(Bson::Timestamp(cluster_time)) => *cluster_time,
            _ => {
                return Err(Error::Document(
                    "server response carries no operation time; change streams require a replica set"
                        .to_owned(),
                ))
            }
        },
    };
    Ok(Timestamp {
        time: operation_time.time,
        increment: operation_time.increment + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_always_matches_inserts_only() {
        let pipeline = change_stream_pipeline(None);
        assert_eq!(pipeline, vec![doc! { "$match": { "operationType": "insert" } }]);
    }

    #[test]
    fn pipeline_merges_filter_criteria() {
        let pipeline = change_stream_pipeline(Some(&SubscriptionFilter::stream_id_equals("name")));
        assert_eq!(
            pipeline,
            vec![doc! { "$match": {
                "operationType": "insert",
                "fullDocument.streamId": "name",
            }}]
        );
    }
}
