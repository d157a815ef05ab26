/*!
 * Error types for the federation broker
 */

use crate::routes::Side;
use fedbroker_core_interface::ConnectorError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Invalid cluster name or configuration; surfaced at construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A side could not be reached or lost its session
    #[error("Connection error on {side} side: {source}")]
    Connection {
        side: Side,
        #[source]
        source: ConnectorError,
    },

    /// The transport rejected a subscription
    #[error("Subscription '{name}' failed: {source}")]
    Subscription {
        name: String,
        #[source]
        source: ConnectorError,
    },

    /// A relayed message could not be published; the message is dropped
    #[error("Publish to '{target}' failed: {reason}")]
    Publish { target: String, reason: String },

    /// Operation not valid in the broker's current lifecycle state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BrokerError {
    /// Fatal errors are returned to the host; everything else only shows up in stats
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Configuration(_)
                | BrokerError::Lifecycle(_)
                | BrokerError::Io(_)
                | BrokerError::Toml(_)
        )
    }

    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection { .. } | BrokerError::Subscription { .. }
        )
    }
}
