//! Competing consumers: at most one replica delivers per subscription id.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::subscription::durable::DurableMongoSubscriptionModel;
use crate::subscription::lease::{LeaseTransition, MongoLeaseCompetingConsumerStrategy};
use crate::subscription::{EventAction, StartAt, Subscription, SubscriptionFilter};

struct Registration {
    paused_by_user: bool,
}

/// Wraps a [`DurableMongoSubscriptionModel`] so that replicas sharing a
/// subscription id compete for a lease, and only the current holder delivers.
///
/// Every replica registers the subscription; the delegate runs it only while
/// this replica holds the lease. A heartbeat task renews held leases and
/// competes for free ones, pausing and resuming the delegate as leases are
/// lost and won. Because the delegate persists positions, a takeover resumes
/// from the last position the previous holder recorded; at most one event per
/// handover may be re-delivered.
pub struct CompetingConsumerSubscriptionModel {
    delegate: Arc<DurableMongoSubscriptionModel>,
    strategy: Arc<MongoLeaseCompetingConsumerStrategy>,
    registrations: Arc<Mutex<HashMap<String, Registration>>>,
    stopped: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl CompetingConsumerSubscriptionModel {
    /// Creates the model and starts its lease heartbeat. Must be called
    /// within a tokio runtime.
    pub fn new(
        delegate: DurableMongoSubscriptionModel,
        strategy: MongoLeaseCompetingConsumerStrategy,
    ) -> Self {
        let delegate = Arc::new(delegate);
        let strategy = Arc::new(strategy);
        let stopped = Arc::new(AtomicBool::new(false));
        let shutdown_token = CancellationToken::new();
        let heartbeat = spawn_heartbeat(
            Arc::clone(&delegate),
            Arc::clone(&strategy),
            Arc::clone(&stopped),
            shutdown_token.clone(),
        );
        Self {
            delegate,
            strategy,
            registrations: Arc::new(Mutex::new(HashMap::new())),
            stopped,
            shutdown_token,
            heartbeat: Mutex::new(Some(heartbeat)),
        }
    }

    /// Registers the subscription on this replica and starts competing for
    /// its lease. Delivery starts once the lease is held.
    pub async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Option<SubscriptionFilter>,
        start_at: StartAt,
        action: impl EventAction + 'static,
    ) -> Result<Subscription, Error> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ModelShutDown);
        }
        if self.lock_registrations().contains_key(subscription_id) {
            return Err(Error::SubscriptionAlreadyExists(subscription_id.to_owned()));
        }
        let leader = self.strategy.register(subscription_id).await?;
        let result = if leader && !self.stopped.load(Ordering::SeqCst) {
            self.delegate
                .subscribe(subscription_id, filter, start_at, action)
        } else {
            self.delegate
                .subscribe_paused(subscription_id, filter, start_at, action)
        };
        match result {
            Ok(subscription) => {
                self.lock_registrations().insert(
                    subscription_id.to_owned(),
                    Registration {
                        paused_by_user: false,
                    },
                );
                // The heartbeat may have won the lease between registering it
                // and registering the delegate; its resume attempt found no
                // subscription, so catch up here.
                if !leader
                    && self.strategy.holds_lease(subscription_id)
                    && !self.stopped.load(Ordering::SeqCst)
                {
                    if let Err(error) = self.delegate.resume_subscription(subscription_id) {
                        tracing::debug!(%subscription_id, %error, "subscription was not resumable after registration");
                    }
                }
                Ok(subscription)
            }
            Err(error) => {
                if let Err(unregister_error) = self.strategy.unregister(subscription_id).await {
                    tracing::warn!(%subscription_id, error = %unregister_error, "failed to release lease");
                }
                Err(error)
            }
        }
    }

    /// Pauses delivery on this replica and stops competing for the lease, so
    /// another replica may take over.
    pub async fn pause_subscription(&self, subscription_id: &str) -> Result<(), Error> {
        {
            let mut registrations = self.lock_registrations();
            let Some(registration) = registrations.get_mut(subscription_id) else {
                return Err(Error::SubscriptionNotRunning(subscription_id.to_owned()));
            };
            if registration.paused_by_user {
                return Err(Error::SubscriptionNotRunning(subscription_id.to_owned()));
            }
            registration.paused_by_user = true;
        }
        // Already paused on the delegate when this replica isn't the holder.
        match self.delegate.pause_subscription(subscription_id) {
            Ok(()) | Err(Error::SubscriptionNotRunning(_)) => {}
            Err(error) => return Err(error),
        }
        self.strategy.suspend(subscription_id).await
    }

    /// Competes for the lease again and resumes delivery once it is held.
    pub async fn resume_subscription(&self, subscription_id: &str) -> Result<Subscription, Error> {
        {
            let mut registrations = self.lock_registrations();
            let Some(registration) = registrations.get_mut(subscription_id) else {
                return Err(Error::SubscriptionNotPaused(subscription_id.to_owned()));
            };
            if !registration.paused_by_user {
                return Err(Error::SubscriptionNotPaused(subscription_id.to_owned()));
            }
            registration.paused_by_user = false;
        }
        let leader = self.strategy.resume_competing(subscription_id).await?;
        if leader && !self.stopped.load(Ordering::SeqCst) {
            self.delegate.resume_subscription(subscription_id)
        } else {
            // Not the holder yet; the heartbeat resumes the delegate when the
            // lease is won.
            self.delegate
                .subscription(subscription_id)
                .ok_or_else(|| Error::SubscriptionNotPaused(subscription_id.to_owned()))
        }
    }

    /// Cancels the subscription, releases its lease and deletes its stored
    /// position. Unknown subscription ids are a no-op.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), Error> {
        self.lock_registrations().remove(subscription_id);
        if let Err(error) = self.strategy.unregister(subscription_id).await {
            tracing::warn!(%subscription_id, %error, "failed to release lease");
        }
        self.delegate.cancel_subscription(subscription_id).await
    }

    /// Resumes delivery for every lease this replica holds. A no-op on a
    /// model that is already running.
    pub fn start(&self) -> Result<(), Error> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ModelShutDown);
        }
        if !self.stopped.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let held: Vec<String> = {
            let registrations = self.lock_registrations();
            registrations
                .iter()
                .filter(|(subscription_id, registration)| {
                    !registration.paused_by_user && self.strategy.holds_lease(subscription_id)
                })
                .map(|(subscription_id, _)| subscription_id.clone())
                .collect()
        };
        for subscription_id in held {
            if let Err(error) = self.delegate.resume_subscription(&subscription_id) {
                tracing::debug!(%subscription_id, %error, "subscription was not resumable on start");
            }
        }
        Ok(())
    }

    /// Pauses all delivery on this replica without giving up registrations.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.delegate.stop();
    }

    /// Shuts the model down: stops the heartbeat, releases every lease and
    /// shuts the delegate down. Terminal.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.await;
        }
        self.lock_registrations().clear();
        self.strategy.release_all().await;
        self.delegate.shutdown().await;
    }

    pub fn is_subscription_running(&self, subscription_id: &str) -> bool {
        self.delegate.is_subscription_running(subscription_id)
    }

    pub fn is_subscription_paused(&self, subscription_id: &str) -> bool {
        self.delegate.is_subscription_paused(subscription_id)
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.delegate.subscription(subscription_id)
    }

    fn lock_registrations(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_heartbeat(
    delegate: Arc<DurableMongoSubscriptionModel>,
    strategy: Arc<MongoLeaseCompetingConsumerStrategy>,
    stopped: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(strategy.heartbeat_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => return,
                _ = tick.tick() => {
                    for transition in strategy.heartbeat().await {
                        match transition {
                            LeaseTransition::Granted(subscription_id) => {
                                if stopped.load(Ordering::SeqCst) {
                                    continue;
                                }
                                if let Err(error) = delegate.resume_subscription(&subscription_id) {
                                    tracing::debug!(%subscription_id, %error, "could not resume after winning the lease");
                                }
                            }
                            LeaseTransition::Lost(subscription_id) => {
                                if let Err(error) = delegate.pause_subscription(&subscription_id) {
                                    tracing::debug!(%subscription_id, %error, "could not pause after losing the lease");
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

impl std::fmt::Debug for CompetingConsumerSubscriptionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompetingConsumerSubscriptionModel")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
