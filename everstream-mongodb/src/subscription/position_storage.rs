//! Persistence of per-subscription positions.
use bson::{doc, Bson, Document};
use mongodb::options::UpdateOptions;
use mongodb::{Collection, Database};

use crate::error::Error;
use crate::subscription::position::SubscriptionPosition;

const RESUME_TOKEN: &str = "resumeToken";
const OPERATION_TIME: &str = "operationTime";

/// Stores the last handled position per subscription id, one document per
/// subscription keyed by `_id`.
#[derive(Clone)]
pub struct MongoSubscriptionPositionStorage {
    collection: Collection<Document>,
}

impl std::fmt::Debug for MongoSubscriptionPositionStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoSubscriptionPositionStorage")
            .field("collection", &self.collection.name())
            .finish()
    }
}

impl MongoSubscriptionPositionStorage {
    pub fn new(db: &Database, collection: &str) -> Self {
        Self {
            collection: db.collection::<Document>(collection),
        }
    }

    pub async fn read(&self, subscription_id: &str) -> Result<Option<SubscriptionPosition>, Error> {
        let Some(document) = self
            .collection
            .find_one(doc! { "_id": subscription_id }, None)
            .await?
        else {
            return Ok(None);
        };
        if let Some(token) = document.get(RESUME_TOKEN) {
            return Ok(Some(SubscriptionPosition::ResumeToken(token.clone())));
        }
        if let Some(Bson::Timestamp(operation_time)) = document.get(OPERATION_TIME) {
            return Ok(Some(SubscriptionPosition::OperationTime(*operation_time)));
        }
        Err(Error::Document(format!(
            "subscription position document for {subscription_id} is malformed"
        )))
    }

    pub async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
    ) -> Result<(), Error> {
        let update = match position {
            SubscriptionPosition::ResumeToken(token) => doc! {
                "$set": { RESUME_TOKEN: token.clone() },
                "$unset": { OPERATION_TIME: "" },
            },
            SubscriptionPosition::OperationTime(operation_time) => doc! {
                "$set": { OPERATION_TIME: *operation_time },
                "$unset": { RESUME_TOKEN: "" },
            },
        };
        self.collection
            .update_one(
                doc! { "_id": subscription_id },
                update,
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    pub async fn delete(&self, subscription_id: &str) -> Result<(), Error> {
        self.collection
            .delete_one(doc! { "_id": subscription_id }, None)
            .await?;
        Ok(())
    }
}
