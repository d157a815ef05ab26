//! Federation Broker Core Interface: the transport contract
//!
//! This crate defines the `Connector` trait, which abstracts a single pub/sub
//! transport session, and the `ConnectionManager` trait that produces one.
//! The broker depends only on these traits and never on a concrete client.
//!
//! # Architecture
//!
//! The `Connector` trait groups its operations in three categories:
//!
//! 1. **Session**: connect, server resolution, connection state
//! 2. **Subscriptions**: named interest, channel-based delivery, pull delivery
//! 3. **Publishing**: direct publish and queue-addressed publish
//!
//! Two kinds of implementation are expected:
//! - A production client supplied by the host (a NATS-like transport)
//! - [`MemoryConnector`]: an in-process transport for tests and loopback
//!
//! # Example
//!
//! ```rust,no_run
//! use fedbroker_core_interface::{
//!     static_resolver, ConnectionManager, Connector, MemoryConnectionManager, Server,
//! };
//!
//! async fn example() -> anyhow::Result<()> {
//!     let manager = MemoryConnectionManager::new();
//!     let resolver = static_resolver(vec![Server::parse("nats://collective.example.net:4222")?]);
//!
//!     let connector = manager
//!         .new_connector(resolver, "test_cluster_collective", tracing::Span::none())
//!         .await?;
//!
//!     let delivery = connector
//!         .chan_queue_subscribe("replies", "choria.reply.>", "", 100)
//!         .await?;
//!
//!     while let Some(msg) = delivery.recv().await {
//!         println!("{} ({} bytes)", msg.subject, msg.data.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod memory;
pub mod subject;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

pub use memory::{MemoryConnectionManager, MemoryConnector};
pub use subject::{subject_matches, validate_subject};

/// Sentinel reported by [`Connector::connected_server`] while no session is up
pub const UNKNOWN_SERVER: &str = "unknown";

/// Scheme assumed for server addresses written without one
pub const DEFAULT_SCHEME: &str = "nats";

/// Port assumed for server addresses written without one
pub const DEFAULT_PORT: u16 = 4222;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("No servers available for {0}")]
    NoServers(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("Invalid server address '{address}': {reason}")]
    InvalidServer { address: String, reason: String },

    #[error("Subscription '{name}' rejected: {reason}")]
    Subscription { name: String, reason: String },

    #[error("Publish to '{target}' failed: {reason}")]
    Publish { target: String, reason: String },

    #[error("Delivery channel for '{0}' is full")]
    ChannelFull(String),

    #[error("Unknown subscription '{0}'")]
    UnknownSubscription(String),

    #[error("Connector is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

/// A transport server address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Server {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Server {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse `scheme://host:port`, `host:port` or a bare `host`
    ///
    /// Missing parts fall back to [`DEFAULT_SCHEME`] and [`DEFAULT_PORT`].
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let invalid = |reason: &str| ConnectorError::InvalidServer {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if address.is_empty() {
            return Err(invalid("empty address"));
        }

        let candidate = if address.contains("://") {
            address.to_string()
        } else {
            format!("{}://{}", DEFAULT_SCHEME, address)
        };

        let url = url::Url::parse(&candidate).map_err(|e| invalid(&e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }

    /// Render as a URL string, e.g. `nats://broker.example.net:4222`
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Produces the list of servers to try on every (re)connect
///
/// Resolvers are re-evaluated on each connection attempt so that service
/// discovery changes and failover lists are picked up without recreating
/// the connector.
pub type ServerResolver = Arc<dyn Fn() -> Result<Vec<Server>> + Send + Sync>;

/// Build a resolver that always yields the same list
///
/// An empty list resolves to [`ConnectorError::NoServers`].
pub fn static_resolver(servers: Vec<Server>) -> ServerResolver {
    Arc::new(move || {
        if servers.is_empty() {
            Err(ConnectorError::NoServers("static server list".to_string()))
        } else {
            Ok(servers.clone())
        }
    })
}

/// A message received from, or published to, a transport
///
/// The payload is opaque to the broker and is relayed byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub data: Vec<u8>,
}

impl ConnectorMessage {
    pub fn new(subject: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            data: data.into(),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// Cloneable handle to one bounded delivery channel
///
/// All clones read from the same underlying receiver, so a handle returned
/// twice for the same subscription can be recognised with
/// [`Delivery::same_channel`].
#[derive(Clone)]
pub struct Delivery {
    name: Arc<str>,
    rx: Arc<Mutex<mpsc::Receiver<ConnectorMessage>>>,
}

impl Delivery {
    pub fn new(name: &str, rx: mpsc::Receiver<ConnectorMessage>) -> Self {
        Self {
            name: Arc::from(name),
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Subscription name this channel belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive the next message, `None` once every sender is gone
    pub async fn recv(&self) -> Option<ConnectorMessage> {
        self.rx.lock().await.recv().await
    }

    /// True when both handles wrap the same receiver
    pub fn same_channel(&self, other: &Delivery) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery").field("name", &self.name).finish()
    }
}

/// One pub/sub transport session
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + 'static`; the broker shares a
/// connector between its supervisor, monitor and relay tasks.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish the session using the installed resolver
    ///
    /// # Errors
    ///
    /// Returns `NoServers` when the resolver yields nothing and `Connection`
    /// when no resolved server can be reached.
    async fn connect(&self) -> Result<()>;

    /// Install or replace the resolver used on the next (re)connect
    fn set_servers(&self, resolver: ServerResolver);

    fn set_name(&self, name: &str);

    fn name(&self) -> String;

    /// Currently connected server, or [`UNKNOWN_SERVER`]
    fn connected_server(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Register pull-style interest; messages surface through [`Connector::receive`]
    async fn subscribe(&self, name: &str, subject: &str, group: &str) -> Result<()>;

    /// Register interest with a bounded delivery channel of `capacity`
    ///
    /// An empty `group` is a fan-out subscription; a non-empty one joins a
    /// competing-consumer group. When the channel is full the transport
    /// blocks rather than dropping.
    async fn chan_queue_subscribe(
        &self,
        name: &str,
        subject: &str,
        group: &str,
        capacity: usize,
    ) -> Result<Delivery>;

    /// Remove a subscription; unknown names succeed
    async fn unsubscribe(&self, name: &str) -> Result<()>;

    /// Publish a payload directly to `target`. Never retried here.
    async fn publish_raw(&self, target: &str, data: &[u8]) -> Result<()>;

    /// Publish into the local delivery path of the named subscription
    async fn publish_to_queue_sub(&self, name: &str, msg: ConnectorMessage) -> Result<()>;

    /// Pull the next message from pull-style subscriptions
    async fn receive(&self) -> Option<ConnectorMessage>;

    /// Drop the session and every subscription
    async fn close(&self);
}

/// Factory for the connector of one side of the bridge
///
/// A manager owns at most one connector. Calling `new_connector` again
/// returns that same instance after installing the new resolver and name,
/// re-dialing it if it is not connected.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// Create (or return) the connector and connect it
    ///
    /// `logger` is the span all connector log events are emitted under.
    async fn new_connector(
        &self,
        servers: ServerResolver,
        name: &str,
        logger: tracing::Span,
    ) -> Result<Arc<dyn Connector>>;
}
