//! Lease-based election of the single active consumer per subscription id.
//!
//! The lease collection holds one document per subscription id:
//! `{ _id, holder, expiresAt }`, with a TTL index on `expiresAt` so that
//! leases of dead holders eventually disappear even without a takeover.
//! At most one non-expired lease exists per subscription id; conditional
//! writes are the only coordination between processes.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bson::{doc, Document};
use mongodb::options::{IndexOptions, UpdateOptions};
use mongodb::{Collection, Database, IndexModel};
use uuid::Uuid;

use crate::error::Error;
use crate::event_store::is_duplicate_key_error;

const HOLDER: &str = "holder";
const EXPIRES_AT: &str = "expiresAt";

/// A lease edge observed by the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeaseTransition {
    Granted(String),
    Lost(String),
}

struct LeaseStatus {
    competing: bool,
    holds_lease: bool,
}

/// Elects one holder per subscription id through conditional upserts on the
/// lease collection.
///
/// Tie-breaking is first-commit-wins: the replica whose upsert commits takes
/// the lease, every competitor observes a duplicate-key rejection. A lease is
/// renewed by the same upsert; failing to renew demotes the holder.
pub struct MongoLeaseCompetingConsumerStrategy {
    collection: Collection<Document>,
    lease_ttl: Duration,
    holder_id: String,
    state: Mutex<HashMap<String, LeaseStatus>>,
}

impl MongoLeaseCompetingConsumerStrategy {
    pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(20);

    /// Creates the TTL index on the lease collection and returns the strategy.
    pub async fn try_new(db: &Database, collection: &str) -> Result<Self, Error> {
        let strategy = Self::new_uninitialized(db, collection);
        strategy
            .collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { EXPIRES_AT: 1 })
                    .options(
                        IndexOptions::builder()
                            .expire_after(Duration::from_secs(0))
                            .build(),
                    )
                    .build(),
                None,
            )
            .await?;
        Ok(strategy)
    }

    /// Creates the strategy without touching the database. The TTL index on
    /// `expiresAt` must already exist; use
    /// [`MongoLeaseCompetingConsumerStrategy::try_new`] to create it.
    pub fn new_uninitialized(db: &Database, collection: &str) -> Self {
        Self {
            collection: db.collection::<Document>(collection),
            lease_ttl: Self::DEFAULT_LEASE_TTL,
            holder_id: Uuid::new_v4().to_string(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// The id this process competes under.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.lease_ttl / 3
    }

    pub(crate) fn holds_lease(&self, subscription_id: &str) -> bool {
        self.lock_state()
            .get(subscription_id)
            .is_some_and(|status| status.holds_lease)
    }

    /// Starts competing for the subscription id, returning whether the lease
    /// was acquired right away.
    pub(crate) async fn register(&self, subscription_id: &str) -> Result<bool, Error> {
        self.lock_state().insert(
            subscription_id.to_owned(),
            LeaseStatus {
                competing: true,
                holds_lease: false,
            },
        );
        let acquired = self.try_acquire_or_renew(subscription_id).await?;
        if let Some(status) = self.lock_state().get_mut(subscription_id) {
            status.holds_lease = acquired;
        }
        Ok(acquired)
    }

    /// Stops competing and releases the lease if held.
    pub(crate) async fn unregister(&self, subscription_id: &str) -> Result<(), Error> {
        let held = self
            .lock_state()
            .remove(subscription_id)
            .is_some_and(|status| status.holds_lease);
        if held {
            self.release(subscription_id).await?;
        }
        Ok(())
    }

    /// Keeps the registration but stops competing until
    /// [`resume_competing`](Self::resume_competing); releases the lease if
    /// held.
    pub(crate) async fn suspend(&self, subscription_id: &str) -> Result<(), Error> {
        let held = {
            let mut state = self.lock_state();
            match state.get_mut(subscription_id) {
                Some(status) => {
                    status.competing = false;
                    std::mem::replace(&mut status.holds_lease, false)
                }
                None => false,
            }
        };
        if held {
            self.release(subscription_id).await?;
        }
        Ok(())
    }

    /// Competes again, returning whether the lease was acquired right away.
    pub(crate) async fn resume_competing(&self, subscription_id: &str) -> Result<bool, Error> {
        {
            let mut state = self.lock_state();
            state
                .entry(subscription_id.to_owned())
                .or_insert(LeaseStatus {
                    competing: true,
                    holds_lease: false,
                })
                .competing = true;
        }
        let acquired = self.try_acquire_or_renew(subscription_id).await?;
        if let Some(status) = self.lock_state().get_mut(subscription_id) {
            status.holds_lease = acquired;
        }
        Ok(acquired)
    }

    /// Renews or tries to take every competing lease, returning the observed
    /// transitions. Run at an interval well below the lease TTL.
    pub(crate) async fn heartbeat(&self) -> Vec<LeaseTransition> {
        let competing: Vec<(String, bool)> = self
            .lock_state()
            .iter()
            .filter(|(_, status)| status.competing)
            .map(|(subscription_id, status)| (subscription_id.clone(), status.holds_lease))
            .collect();
        let mut transitions = Vec::new();
        for (subscription_id, had_lease) in competing {
            let has_lease = match self.try_acquire_or_renew(&subscription_id).await {
                Ok(has_lease) => has_lease,
                Err(error) => {
                    tracing::warn!(%subscription_id, %error, "lease renewal failed");
                    false
                }
            };
            {
                let mut state = self.lock_state();
                match state.get_mut(&subscription_id) {
                    // Competing may have been suspended while the upsert ran.
                    Some(status) if status.competing => status.holds_lease = has_lease,
                    _ => continue,
                }
            }
            if has_lease && !had_lease {
                transitions.push(LeaseTransition::Granted(subscription_id));
            } else if !has_lease && had_lease {
                transitions.push(LeaseTransition::Lost(subscription_id));
            }
        }
        transitions
    }

    /// Stops competing for everything and releases every held lease.
    pub(crate) async fn release_all(&self) {
        let held: Vec<String> = {
            let mut state = self.lock_state();
            let held = state
                .iter()
                .filter(|(_, status)| status.holds_lease)
                .map(|(subscription_id, _)| subscription_id.clone())
                .collect();
            state.clear();
            held
        };
        for subscription_id in held {
            if let Err(error) = self.release(&subscription_id).await {
                tracing::warn!(%subscription_id, %error, "failed to release lease");
            }
        }
    }

    /// One conditional upsert covers the whole election: insert when no lease
    /// exists, take over an expired lease, renew our own. A duplicate-key
    /// rejection means another holder owns a non-expired lease.
    async fn try_acquire_or_renew(&self, subscription_id: &str) -> Result<bool, Error> {
        let now = bson::DateTime::now();
        let expires_at =
            bson::DateTime::from_millis(now.timestamp_millis() + self.lease_ttl.as_millis() as i64);
        let filter = doc! {
            "_id": subscription_id,
            "$or": [
                { EXPIRES_AT: { "$lt": now } },
                { HOLDER: &self.holder_id },
            ],
        };
        let update = doc! { "$set": { HOLDER: &self.holder_id, EXPIRES_AT: expires_at } };
        match self
            .collection
            .update_one(
                filter,
                update,
                UpdateOptions::builder().upsert(true).build(),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if is_duplicate_key_error(&error) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn release(&self, subscription_id: &str) -> Result<(), Error> {
        self.collection
            .delete_one(
                doc! { "_id": subscription_id, HOLDER: &self.holder_id },
                None,
            )
            .await?;
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, HashMap<String, LeaseStatus>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MongoLeaseCompetingConsumerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoLeaseCompetingConsumerStrategy")
            .field("holder_id", &self.holder_id)
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}
