//! # Messaging Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Queue database error during {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Invalid queue name: {queue_name}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Could not encode message: {message}")]
    Encode { message: String },

    /// The payload can never be decoded; redelivery will not help
    #[error("Malformed message payload: {message}")]
    MalformedPayload { message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn invalid_queue_name(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn is_malformed_payload(&self) -> bool {
        matches!(self, Self::MalformedPayload { .. })
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => MessagingError::database("query", db_err.to_string()),
            sqlx::Error::PoolTimedOut => {
                MessagingError::database("pool", "Connection pool timed out")
            }
            _ => MessagingError::database("connection", err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            MessagingError::MalformedPayload {
                message: err.to_string(),
            }
        } else {
            MessagingError::Encode {
                message: err.to_string(),
            }
        }
    }
}

impl From<pgmq::errors::PgmqError> for MessagingError {
    fn from(err: pgmq::errors::PgmqError) -> Self {
        MessagingError::queue_operation("unknown", "pgmq", err.to_string())
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undecodable_json_is_malformed() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let err: MessagingError = json_err.into();
        assert!(err.is_malformed_payload());

        let missing_field = serde_json::from_value::<crate::messaging::CompletionSignal>(
            serde_json::json!({"executionId": "nope"}),
        )
        .unwrap_err();
        assert!(MessagingError::from(missing_field).is_malformed_payload());
    }

    #[test]
    fn test_error_display() {
        let err = MessagingError::queue_operation("script_step_dispatch", "read", "Read failed");
        let display = format!("{err}");
        assert!(display.contains("script_step_dispatch"));
        assert!(display.contains("Read failed"));

        let err: MessagingError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, MessagingError::Database { .. }));
    }
}
