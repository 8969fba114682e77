use everstream::WriteCondition;
use thiserror::Error;

/// Represents all the ways a method can fail within the MongoDB backend.
#[derive(Error, Debug)]
pub enum Error {
    /// The write condition did not hold against the current stream version.
    /// The store is left unchanged.
    #[error("WriteCondition was not fulfilled. Expected version {condition} but was {actual}.")]
    WriteConditionNotFulfilled {
        condition: WriteCondition,
        actual: i64,
    },
    /// An event with the same `(id, source)` already exists, either in the
    /// store or earlier in the same batch. Always wraps the bulk-write error
    /// reported by the server.
    #[error("duplicate cloud event")]
    DuplicateCloudEvent(#[source] mongodb::error::Error),
    /// A non-trivial write condition was supplied to a store configured with
    /// [`StreamConsistencyGuarantee::None`](crate::StreamConsistencyGuarantee).
    #[error("write conditions require the transactional stream consistency guarantee")]
    WriteConditionNotSupported,
    /// Stream ids are opaque non-empty strings.
    #[error("stream id must be a non-empty string")]
    InvalidStreamId,
    #[error("subscription {0} is already defined")]
    SubscriptionAlreadyExists(String),
    #[error("subscription {0} isn't running")]
    SubscriptionNotRunning(String),
    #[error("subscription {0} isn't paused")]
    SubscriptionNotPaused(String),
    #[error("the subscription model is shut down")]
    ModelShutDown,
    /// The change stream lost the history needed to resume from the stored
    /// position and restarting from "now" is disabled.
    #[error("subscription {0} lost its change stream history")]
    CatchupImpossible(String),
    /// A stored document does not have the expected shape.
    #[error("invalid document: {0}")]
    Document(String),
    /// Error returned from the database.
    #[error("database error")]
    Database(#[from] mongodb::error::Error),
}

impl Error {
    /// Whether the whole transaction this error aborted can be retried.
    pub(crate) fn is_transient_transaction_error(&self) -> bool {
        match self {
            Error::Database(error) => {
                error.contains_label(mongodb::error::TRANSIENT_TRANSACTION_ERROR)
            }
            _ => false,
        }
    }
}
