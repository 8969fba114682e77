//! Integration tests for the change-stream subscription models.
//!
//! These tests require Docker to be running and spin up a single-node MongoDB
//! replica set using testcontainers.
use std::time::Duration;

use chrono::{TimeZone, Utc};
use everstream::{CloudEvent, EventStore};
use everstream_mongodb::{
    ActionError, CompetingConsumerSubscriptionModel, DurableMongoSubscriptionModel, Error,
    EventStoreConfig, MongoEventStore, MongoLeaseCompetingConsumerStrategy, MongoSubscriptionModel,
    MongoSubscriptionPositionStorage, PositionAwareCloudEvent, StartAt,
    StreamConsistencyGuarantee, SubscriptionFilter, TimeRepresentation,
};
use mongodb::{Client, Database};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::mongo::Mongo;
use tokio::sync::mpsc;
use uuid::Uuid;

const DATABASE: &str = "everstream";
const EVENTS: &str = "events";
const POSITIONS: &str = "subscriptionPositions";

struct TestDb {
    _container: ContainerAsync<Mongo>,
    client: Client,
}

impl TestDb {
    async fn new() -> Self {
        let container = Mongo::repl_set().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(27017).await.unwrap();

        let connection_string = format!("mongodb://{host}:{port}/?directConnection=true");
        let client = Client::with_uri_str(&connection_string).await.unwrap();

        Self {
            _container: container,
            client,
        }
    }

    fn database(&self) -> Database {
        self.client.database(DATABASE)
    }

    async fn store(&self) -> MongoEventStore {
        let config = EventStoreConfig::new(EVENTS)
            .with_consistency(StreamConsistencyGuarantee::transactional("streamVersions"))
            .with_time_representation(TimeRepresentation::Date);
        MongoEventStore::try_new(self.client.clone(), DATABASE, config)
            .await
            .unwrap()
    }

    fn subscription_model(&self) -> MongoSubscriptionModel {
        MongoSubscriptionModel::new(self.database(), EVENTS, TimeRepresentation::Date)
    }

    fn durable_model(&self) -> DurableMongoSubscriptionModel {
        DurableMongoSubscriptionModel::new(
            self.subscription_model(),
            MongoSubscriptionPositionStorage::new(&self.database(), POSITIONS),
        )
    }
}

fn name_defined(name: &str) -> CloudEvent {
    CloudEvent::new(Uuid::new_v4().to_string(), "http://name", "NameDefined")
        .with_time(Utc.with_ymd_and_hms(2021, 3, 14, 9, 26, 53).unwrap())
        .with_subject(name)
}

fn name_was_changed(name: &str) -> CloudEvent {
    CloudEvent::new(Uuid::new_v4().to_string(), "http://name", "NameWasChanged")
        .with_time(Utc.with_ymd_and_hms(2021, 3, 14, 10, 26, 53).unwrap())
        .with_subject(name)
}

fn recording(tx: mpsc::UnboundedSender<String>) -> impl Fn(PositionAwareCloudEvent) -> futures::future::BoxFuture<'static, Result<(), ActionError>> + Send + Sync {
    move |event: PositionAwareCloudEvent| {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(event.id().to_owned()).unwrap();
            Ok(())
        })
    }
}

async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery channel closed")
}

async fn wait_for_stored_position(storage: &MongoSubscriptionPositionStorage, id: &str) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if storage.read(id).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("timed out waiting for the position to be stored");
}

#[tokio::test]
async fn subscription_delivers_persisted_events_in_order() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let model = db.subscription_model();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut subscription = model
        .subscribe("names", None, StartAt::now(), recording(tx))
        .unwrap();
    assert!(subscription.wait_until_started(Duration::from_secs(30)).await);

    let first = name_defined("John Doe");
    let second = name_was_changed("Jan Doe");
    store
        .write("name", vec![first.clone(), second.clone()])
        .await
        .unwrap();

    assert_eq!(next_delivery(&mut rx).await, first.id());
    assert_eq!(next_delivery(&mut rx).await, second.id());
    model.shutdown().await;
}

#[tokio::test]
async fn subscription_filters_are_applied_server_side() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let model = db.subscription_model();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut subscription = model
        .subscribe(
            "defined-only",
            Some(SubscriptionFilter::type_equals("NameDefined")),
            StartAt::now(),
            recording(tx),
        )
        .unwrap();
    assert!(subscription.wait_until_started(Duration::from_secs(30)).await);

    let changed = name_was_changed("Jan Doe");
    let defined = name_defined("John Doe");
    store
        .write("name", vec![changed, defined.clone()])
        .await
        .unwrap();

    // Only the matching event is shipped; the filtered-out one never arrives.
    assert_eq!(next_delivery(&mut rx).await, defined.id());
    assert!(rx.try_recv().is_err());
    model.shutdown().await;
}

#[tokio::test]
async fn durable_subscriptions_resume_after_restart_without_redelivery() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let storage = MongoSubscriptionPositionStorage::new(&db.database(), POSITIONS);

    let model = db.durable_model();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscription = model
        .subscribe(
            "names",
            None,
            StartAt::subscription_model_default(),
            recording(tx),
        )
        .unwrap();
    assert!(subscription.wait_until_started(Duration::from_secs(30)).await);

    let first = name_defined("John Doe");
    store.write("name", vec![first.clone()]).await.unwrap();
    assert_eq!(next_delivery(&mut rx).await, first.id());
    wait_for_stored_position(&storage, "names").await;
    model.shutdown().await;

    // A new instance with the same subscription id resumes from the stored
    // position: the second event arrives, the first is not re-delivered.
    let restarted = db.durable_model();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscription = restarted
        .subscribe(
            "names",
            None,
            StartAt::subscription_model_default(),
            recording(tx),
        )
        .unwrap();
    assert!(subscription.wait_until_started(Duration::from_secs(30)).await);

    let second = name_was_changed("Jan Doe");
    store.write("name", vec![second.clone()]).await.unwrap();
    assert_eq!(next_delivery(&mut rx).await, second.id());
    restarted.shutdown().await;
}

#[tokio::test]
async fn paused_subscriptions_catch_up_on_resume() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let storage = MongoSubscriptionPositionStorage::new(&db.database(), POSITIONS);
    let model = db.durable_model();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut subscription = model
        .subscribe(
            "names",
            None,
            StartAt::subscription_model_default(),
            recording(tx),
        )
        .unwrap();
    assert!(subscription.wait_until_started(Duration::from_secs(30)).await);

    let first = name_defined("John Doe");
    store.write("name", vec![first.clone()]).await.unwrap();
    assert_eq!(next_delivery(&mut rx).await, first.id());
    wait_for_stored_position(&storage, "names").await;

    model.pause_subscription("names").unwrap();
    assert!(model.is_subscription_paused("names"));

    let second = name_was_changed("Jan Doe");
    store.write("name", vec![second.clone()]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err());

    let mut resumed = model.resume_subscription("names").unwrap();
    assert!(resumed.wait_until_started(Duration::from_secs(30)).await);
    assert_eq!(next_delivery(&mut rx).await, second.id());
    model.shutdown().await;
}

#[tokio::test]
async fn lifecycle_misuse_is_reported() {
    let db = TestDb::new().await;
    let model = db.subscription_model();
    let (tx, _rx) = mpsc::unbounded_channel();

    model
        .subscribe("names", None, StartAt::now(), recording(tx.clone()))
        .unwrap();
    assert!(matches!(
        model.subscribe("names", None, StartAt::now(), recording(tx.clone())),
        Err(Error::SubscriptionAlreadyExists(_))
    ));
    assert!(matches!(
        model.pause_subscription("unknown"),
        Err(Error::SubscriptionNotRunning(_))
    ));
    assert!(matches!(
        model.resume_subscription("names"),
        Err(Error::SubscriptionNotPaused(_))
    ));

    model.cancel_subscription("unknown");
    model.shutdown().await;
    assert!(matches!(
        model.subscribe("late", None, StartAt::now(), recording(tx)),
        Err(Error::ModelShutDown)
    ));
    assert!(matches!(model.start(), Err(Error::ModelShutDown)));
}

#[tokio::test]
async fn competing_consumers_deliver_through_one_replica_at_a_time() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let replica1 = CompetingConsumerSubscriptionModel::new(
        db.durable_model(),
        MongoLeaseCompetingConsumerStrategy::try_new(&db.database(), "leases")
            .await
            .unwrap()
            .with_lease_ttl(Duration::from_secs(2)),
    );
    let replica2 = CompetingConsumerSubscriptionModel::new(
        db.durable_model(),
        MongoLeaseCompetingConsumerStrategy::try_new(&db.database(), "leases")
            .await
            .unwrap()
            .with_lease_ttl(Duration::from_secs(2)),
    );

    let mut subscription1 = replica1
        .subscribe(
            "names",
            None,
            StartAt::subscription_model_default(),
            recording(tx1),
        )
        .await
        .unwrap();
    let mut subscription2 = replica2
        .subscribe(
            "names",
            None,
            StartAt::subscription_model_default(),
            recording(tx2),
        )
        .await
        .unwrap();

    // Exactly one replica holds the lease and delivers.
    let leader_is_first = replica1.is_subscription_running("names");
    assert_ne!(leader_is_first, replica2.is_subscription_running("names"));
    let leader_subscription = if leader_is_first {
        &mut subscription1
    } else {
        &mut subscription2
    };
    assert!(
        leader_subscription
            .wait_until_started(Duration::from_secs(30))
            .await
    );

    let events: Vec<CloudEvent> = (0..5).map(|i| name_defined(&format!("name{i}"))).collect();
    store.write("name", events.clone()).await.unwrap();

    let (leader_rx, standby_rx, leader, standby) = if leader_is_first {
        (&mut rx1, &mut rx2, &replica1, &replica2)
    } else {
        (&mut rx2, &mut rx1, &replica2, &replica1)
    };
    for event in &events {
        assert_eq!(next_delivery(leader_rx).await, event.id());
    }
    assert!(standby_rx.try_recv().is_err());

    // Pausing the holder releases the lease; the standby takes over and
    // resumes from the stored position.
    leader.pause_subscription("names").await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), async {
        while !standby.is_subscription_running("names") {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("timed out waiting for the lease takeover");

    let after = name_was_changed("afterwards");
    store.write("name", vec![after.clone()]).await.unwrap();
    assert_eq!(next_delivery(standby_rx).await, after.id());

    replica1.shutdown().await;
    replica2.shutdown().await;
}
