//! Durable subscriptions: the last handled position survives restarts.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use everstream::RetryStrategy;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::subscription::position_storage::MongoSubscriptionPositionStorage;
use crate::subscription::{
    ActionError, EventAction, MongoSubscriptionModel, PositionAwareCloudEvent, StartAt,
    Subscription, SubscriptionFilter,
};

/// Decorates [`MongoSubscriptionModel`] with per-subscription position
/// persistence.
///
/// The position is written strictly after the action returned successfully,
/// so delivery is at least once: a crash between the action and the position
/// write re-delivers the event on restart. [`StartAt::Default`] resolves to
/// the stored position, or to "now" for a subscription that has never handled
/// an event. The stored position is re-read on every resume, so a position
/// written concurrently by another instance is honored.
#[derive(Debug)]
pub struct DurableMongoSubscriptionModel {
    model: MongoSubscriptionModel,
    storage: MongoSubscriptionPositionStorage,
    retry_strategy: RetryStrategy,
}

impl DurableMongoSubscriptionModel {
    pub fn new(model: MongoSubscriptionModel, storage: MongoSubscriptionPositionStorage) -> Self {
        Self {
            model,
            storage,
            retry_strategy: RetryStrategy::exponential(
                Duration::from_millis(100),
                Duration::from_secs(2),
                2.0,
            ),
        }
    }

    /// Sets the retry strategy applied when persisting positions.
    pub fn with_retry_strategy(mut self, retry_strategy: RetryStrategy) -> Self {
        self.retry_strategy = retry_strategy;
        self
    }

    pub fn subscribe(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        action: impl EventAction + 'static,
    ) -> Result<Subscription, Error> {
        self.model.subscribe(
            subscription_id,
            filter,
            self.durable_start_at(subscription_id, start_at),
            self.persisting_action(subscription_id, action),
        )
    }

    pub fn subscribe_paused(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        action: impl EventAction + 'static,
    ) -> Result<Subscription, Error> {
        self.model.subscribe_paused(
            subscription_id,
            filter,
            self.durable_start_at(subscription_id, start_at),
            self.persisting_action(subscription_id, action),
        )
    }

    /// Cancels the subscription and deletes its stored position.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), Error> {
        self.model.cancel_subscription(subscription_id);
        self.storage.delete(subscription_id).await
    }

    pub fn pause_subscription(&self, subscription_id: &str) -> Result<(), Error> {
        self.model.pause_subscription(subscription_id)
    }

    pub fn resume_subscription(&self, subscription_id: &str) -> Result<Subscription, Error> {
        self.model.resume_subscription(subscription_id)
    }

    pub fn start(&self) -> Result<(), Error> {
        self.model.start()
    }

    pub fn stop(&self) {
        self.model.stop();
    }

    pub async fn shutdown(&self) {
        self.model.shutdown().await;
    }

    pub fn is_subscription_running(&self, subscription_id: &str) -> bool {
        self.model.is_subscription_running(subscription_id)
    }

    pub fn is_subscription_paused(&self, subscription_id: &str) -> bool {
        self.model.is_subscription_paused(subscription_id)
    }

    pub fn is_running(&self) -> bool {
        self.model.is_running()
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.model.subscription(subscription_id)
    }

    pub fn position_storage(&self) -> &MongoSubscriptionPositionStorage {
        &self.storage
    }

    fn durable_start_at(&self, subscription_id: &str, start_at: StartAt) -> StartAt {
        match start_at {
            StartAt::Default => {
                let storage = self.storage.clone();
                let subscription_id = subscription_id.to_owned();
                StartAt::dynamic(move || {
                    let storage = storage.clone();
                    let subscription_id = subscription_id.clone();
                    Box::pin(async move {
                        match storage.read(&subscription_id).await {
                            Ok(Some(position)) => StartAt::Position(position),
                            Ok(None) => StartAt::Now,
                            Err(error) => {
                                tracing::warn!(
                                    %subscription_id,
                                    %error,
                                    "failed to read the stored subscription position, starting from now"
                                );
                                StartAt::Now
                            }
                        }
                    })
                })
            }
            other => other,
        }
    }

    fn persisting_action(
        &self,
        subscription_id: &str,
        action: impl EventAction + 'static,
    ) -> PositionPersistingAction {
        PositionPersistingAction {
            action: Arc::new(action),
            storage: self.storage.clone(),
            subscription_id: subscription_id.to_owned(),
            retry_strategy: self.retry_strategy.clone(),
            shutdown: self.model.cancellation_token(),
        }
    }
}

/// Invokes the wrapped action, then persists the event's position.
struct PositionPersistingAction {
    action: Arc<dyn EventAction>,
    storage: MongoSubscriptionPositionStorage,
    subscription_id: String,
    retry_strategy: RetryStrategy,
    shutdown: CancellationToken,
}

#[async_trait]
impl EventAction for PositionPersistingAction {
    async fn handle(&self, event: PositionAwareCloudEvent) -> Result<(), ActionError> {
        let position = event.position().clone();
        self.action.handle(event).await?;
        self.retry_strategy
            .execute(
                || !self.shutdown.is_cancelled(),
                || self.storage.save(&self.subscription_id, &position),
            )
            .await
            .map_err(|error| Box::new(error) as ActionError)?;
        Ok(())
    }
}
