//! Error taxonomy for the bridge.

use thiserror::Error;

/// Failure reported by a transport implementation.
///
/// Transports only say *what* went wrong; the component that issued the
/// operation decides which [`BridgeError`] it becomes.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BrokerError {
    pub message: String,
}

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors surfaced by the handler and its components.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Broker unreachable or connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// Exchange/queue declaration or binding conflicts with the broker.
    #[error("topology error: {0}")]
    Topology(String),

    /// The pool already holds `max_consumers` registrations.
    #[error("consumer quota exceeded (max consumers: {max_consumers})")]
    QuotaExceeded { max_consumers: usize },

    /// The outbound message could not be serialized.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The broker rejected a publish or the channel is closed.
    #[error("publish error: {0}")]
    Publish(String),

    /// The broker refused a subscription or cancellation.
    #[error("consume error: {0}")]
    Consume(String),

    #[error("handler is not prepared")]
    NotPrepared,

    #[error("no recycler is configured for this handler")]
    RecyclerNotConfigured,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// The configured limit, when this is a quota rejection.
    pub fn max_consumers(&self) -> Option<usize> {
        match self {
            BridgeError::QuotaExceeded { max_consumers } => Some(*max_consumers),
            _ => None,
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, BridgeError::QuotaExceeded { .. })
    }

    /// Whether the handler must be prepared again before further use.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Connection(_) | BridgeError::Topology(_))
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
