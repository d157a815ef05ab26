//! In-memory transport
//!
//! `MemoryConnector` implements [`Connector`] without any network. Messages
//! enter through [`MemoryConnector::inject`] (as if published by a remote
//! client) and everything the connector publishes with `publish_raw` lands in
//! an outbox that tests can drain with [`MemoryConnector::next_published`].
//!
//! Delivery follows the usual pub/sub rules: every fan-out subscription
//! (empty group) whose pattern matches receives a copy, and each non-empty
//! queue group receives exactly one copy, handed to its members round-robin.
//!
//! Faults can be injected to exercise the broker's degraded paths: refused
//! connects, failing or stalled publishes, rejected subscriptions, and
//! [`MemoryConnector::drop_connection`], which behaves like a lost session
//! and closes every delivery channel.

use crate::subject::{subject_matches, validate_subject};
use crate::{
    ConnectionManager, Connector, ConnectorError, ConnectorMessage, Delivery, Result, Server,
    ServerResolver, UNKNOWN_SERVER,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn, Span};

/// Capacity of the queue behind [`Connector::receive`]
const PULL_CAPACITY: usize = 1000;

enum Sink {
    Channel {
        tx: mpsc::Sender<ConnectorMessage>,
        delivery: Delivery,
    },
    Pull,
}

struct MemorySubscription {
    subject: String,
    group: String,
    sink: Sink,
}

#[derive(Default)]
struct Faults {
    refuse_connect: bool,
    fail_publish: bool,
    stall_publish: bool,
    reject_subscriptions: bool,
    subscribe_delay: Option<Duration>,
}

struct State {
    name: String,
    resolver: Option<ServerResolver>,
    connected: Option<Server>,
    closed: bool,
    connects: usize,
    // Ordered by name so queue-group selection is deterministic
    subscriptions: BTreeMap<String, MemorySubscription>,
    group_cursor: HashMap<String, usize>,
    faults: Faults,
}

enum Target {
    Channel(String, mpsc::Sender<ConnectorMessage>),
    Pull,
}

/// In-process [`Connector`] used for tests and loopback wiring
pub struct MemoryConnector {
    state: Mutex<State>,
    logger: Mutex<Span>,
    outbox_tx: mpsc::UnboundedSender<ConnectorMessage>,
    outbox_rx: AsyncMutex<mpsc::UnboundedReceiver<ConnectorMessage>>,
    pull_tx: mpsc::Sender<ConnectorMessage>,
    pull_rx: AsyncMutex<mpsc::Receiver<ConnectorMessage>>,
    published: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(name: &str) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (pull_tx, pull_rx) = mpsc::channel(PULL_CAPACITY);

        Self {
            state: Mutex::new(State {
                name: name.to_string(),
                resolver: None,
                connected: None,
                closed: false,
                connects: 0,
                subscriptions: BTreeMap::new(),
                group_cursor: HashMap::new(),
                faults: Faults::default(),
            }),
            logger: Mutex::new(Span::none()),
            outbox_tx,
            outbox_rx: AsyncMutex::new(outbox_rx),
            pull_tx,
            pull_rx: AsyncMutex::new(pull_rx),
            published: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn logger(&self) -> Span {
        self.logger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install the span log events are emitted under
    pub fn set_logger(&self, logger: Span) {
        *self.logger.lock().unwrap_or_else(PoisonError::into_inner) = logger;
    }

    /// Refuse (or allow again) connection attempts
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.state().faults.refuse_connect = refuse;
    }

    /// Make `publish_raw` fail
    pub fn set_fail_publish(&self, fail: bool) {
        self.state().faults.fail_publish = fail;
    }

    /// Make `publish_raw` hang until the caller gives up
    pub fn set_stall_publish(&self, stall: bool) {
        self.state().faults.stall_publish = stall;
    }

    /// Reject new subscriptions
    pub fn set_reject_subscriptions(&self, reject: bool) {
        self.state().faults.reject_subscriptions = reject;
    }

    /// Make every subscribe call take `delay` (a slow transport round trip)
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        self.state().faults.subscribe_delay = delay;
    }

    /// Simulate a lost session: disconnect and close every delivery channel
    pub fn drop_connection(&self) {
        let mut state = self.state();
        warn!(parent: &self.logger(), name = %state.name, "Dropping connection");
        state.connected = None;
        state.subscriptions.clear();
    }

    /// Number of successful `connect` calls
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Number of messages accepted by `publish_raw`
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Active subscriptions as `(name, subject, group)`, sorted by name
    pub fn subscriptions(&self) -> Vec<(String, String, String)> {
        self.state()
            .subscriptions
            .iter()
            .map(|(name, sub)| (name.clone(), sub.subject.clone(), sub.group.clone()))
            .collect()
    }

    pub fn has_subscription(&self, name: &str) -> bool {
        self.state().subscriptions.contains_key(name)
    }

    /// Wait up to `timeout` for the next message published with `publish_raw`
    pub async fn next_published(&self, timeout: Duration) -> Option<ConnectorMessage> {
        let mut outbox = self.outbox_rx.lock().await;
        tokio::time::timeout(timeout, outbox.recv())
            .await
            .ok()
            .flatten()
    }

    /// Deliver a message as if a remote client published it
    ///
    /// Waits while a target channel is full. Returns the number of
    /// subscriptions the message was handed to.
    pub async fn inject(&self, msg: ConnectorMessage) -> Result<usize> {
        let targets = self.select_targets(&msg.subject)?;
        let mut delivered = 0;

        for target in targets {
            let sent = match target {
                Target::Channel(_, tx) => tx.send(msg.clone()).await.is_ok(),
                Target::Pull => self.pull_tx.send(msg.clone()).await.is_ok(),
            };
            if sent {
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Like [`MemoryConnector::inject`] but fails with `ChannelFull` instead of waiting
    pub fn try_inject(&self, msg: ConnectorMessage) -> Result<usize> {
        let targets = self.select_targets(&msg.subject)?;
        let mut delivered = 0;

        for target in targets {
            let result = match &target {
                Target::Channel(_, tx) => tx.try_send(msg.clone()),
                Target::Pull => self.pull_tx.try_send(msg.clone()),
            };
            match result {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let name = match target {
                        Target::Channel(name, _) => name,
                        Target::Pull => "receive".to_string(),
                    };
                    return Err(ConnectorError::ChannelFull(name));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        Ok(delivered)
    }

    /// Non-blocking variant of `publish_to_queue_sub`
    pub fn try_publish_to_queue_sub(&self, name: &str, msg: ConnectorMessage) -> Result<()> {
        match self.queue_sub_target(name)? {
            Target::Channel(_, tx) => tx.try_send(msg).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectorError::ChannelFull(name.to_string()),
                mpsc::error::TrySendError::Closed(_) => closed_channel(name),
            }),
            Target::Pull => self.pull_tx.try_send(msg).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectorError::ChannelFull(name.to_string()),
                mpsc::error::TrySendError::Closed(_) => closed_channel(name),
            }),
        }
    }

    fn queue_sub_target(&self, name: &str) -> Result<Target> {
        let state = self.state();
        if state.closed {
            return Err(ConnectorError::Closed);
        }

        match state.subscriptions.get(name).map(|sub| &sub.sink) {
            Some(Sink::Channel { tx, .. }) => Ok(Target::Channel(name.to_string(), tx.clone())),
            Some(Sink::Pull) => Ok(Target::Pull),
            None => Err(ConnectorError::UnknownSubscription(name.to_string())),
        }
    }

    fn select_targets(&self, subject: &str) -> Result<Vec<Target>> {
        let mut state = self.state();
        if state.closed {
            return Err(ConnectorError::Closed);
        }
        if state.connected.is_none() {
            return Err(ConnectorError::NotConnected);
        }

        let mut targets = Vec::new();
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (name, sub) in &state.subscriptions {
            if !subject_matches(&sub.subject, subject) {
                continue;
            }
            if sub.group.is_empty() {
                targets.push(sink_target(name, &sub.sink));
            } else {
                groups.entry(sub.group.clone()).or_default().push(name.clone());
            }
        }

        for (group, members) in groups {
            let cursor = state.group_cursor.entry(group).or_insert(0);
            let chosen = members[*cursor % members.len()].clone();
            *cursor = cursor.wrapping_add(1);

            if let Some(sub) = state.subscriptions.get(&chosen) {
                targets.push(sink_target(&chosen, &sub.sink));
            }
        }

        Ok(targets)
    }

    async fn check_subscribable(&self, name: &str, subject: &str) -> Result<()> {
        let delay = self.state().faults.subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state();
        if state.closed {
            return Err(ConnectorError::Closed);
        }
        if state.faults.reject_subscriptions {
            return Err(ConnectorError::Subscription {
                name: name.to_string(),
                reason: "rejected by transport".to_string(),
            });
        }
        drop(state);

        validate_subject(subject)
    }
}

fn sink_target(name: &str, sink: &Sink) -> Target {
    match sink {
        Sink::Channel { tx, .. } => Target::Channel(name.to_string(), tx.clone()),
        Sink::Pull => Target::Pull,
    }
}

fn closed_channel(name: &str) -> ConnectorError {
    ConnectorError::Publish {
        target: name.to_string(),
        reason: "delivery channel closed".to_string(),
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<()> {
        let (name, resolver) = {
            let state = self.state();
            if state.closed {
                return Err(ConnectorError::Closed);
            }
            if state.faults.refuse_connect {
                return Err(ConnectorError::Connection(format!(
                    "{}: all servers refused the connection",
                    state.name
                )));
            }
            (state.name.clone(), state.resolver.clone())
        };

        let resolver = resolver.ok_or_else(|| ConnectorError::NoServers(name.clone()))?;
        let servers = resolver()?;
        if servers.is_empty() {
            return Err(ConnectorError::NoServers(name));
        }

        let mut state = self.state();
        // Rotate through the list on every reconnect
        let server = servers[state.connects % servers.len()].clone();
        state.connects += 1;

        info!(parent: &self.logger(), name = %state.name, server = %server, "Connected");
        state.connected = Some(server);

        Ok(())
    }

    fn set_servers(&self, resolver: ServerResolver) {
        self.state().resolver = Some(resolver);
    }

    fn set_name(&self, name: &str) {
        self.state().name = name.to_string();
    }

    fn name(&self) -> String {
        self.state().name.clone()
    }

    fn connected_server(&self) -> String {
        self.state()
            .connected
            .as_ref()
            .map(Server::url)
            .unwrap_or_else(|| UNKNOWN_SERVER.to_string())
    }

    fn is_connected(&self) -> bool {
        self.state().connected.is_some()
    }

    async fn subscribe(&self, name: &str, subject: &str, group: &str) -> Result<()> {
        self.check_subscribable(name, subject).await?;

        debug!(parent: &self.logger(), name, subject, group, "Subscribing");
        self.state().subscriptions.insert(
            name.to_string(),
            MemorySubscription {
                subject: subject.to_string(),
                group: group.to_string(),
                sink: Sink::Pull,
            },
        );

        Ok(())
    }

    async fn chan_queue_subscribe(
        &self,
        name: &str,
        subject: &str,
        group: &str,
        capacity: usize,
    ) -> Result<Delivery> {
        self.check_subscribable(name, subject).await?;
        if capacity == 0 {
            return Err(ConnectorError::Subscription {
                name: name.to_string(),
                reason: "channel capacity must be at least 1".to_string(),
            });
        }

        let mut state = self.state();

        // Re-subscribing keeps the existing channel and updates its interest
        if let Some(sub) = state.subscriptions.get_mut(name) {
            if let Sink::Channel { delivery, .. } = &sub.sink {
                let delivery = delivery.clone();
                sub.subject = subject.to_string();
                sub.group = group.to_string();
                return Ok(delivery);
            }
        }

        debug!(parent: &self.logger(), name, subject, group, capacity, "Subscribing with channel");
        let (tx, rx) = mpsc::channel(capacity);
        let delivery = Delivery::new(name, rx);
        state.subscriptions.insert(
            name.to_string(),
            MemorySubscription {
                subject: subject.to_string(),
                group: group.to_string(),
                sink: Sink::Channel {
                    tx,
                    delivery: delivery.clone(),
                },
            },
        );

        Ok(delivery)
    }

    async fn unsubscribe(&self, name: &str) -> Result<()> {
        if self.state().subscriptions.remove(name).is_some() {
            debug!(parent: &self.logger(), name, "Unsubscribed");
        }
        Ok(())
    }

    async fn publish_raw(&self, target: &str, data: &[u8]) -> Result<()> {
        let stall = {
            let state = self.state();
            if state.closed {
                return Err(ConnectorError::Closed);
            }
            if state.connected.is_none() {
                return Err(ConnectorError::NotConnected);
            }
            if state.faults.fail_publish {
                return Err(ConnectorError::Publish {
                    target: target.to_string(),
                    reason: "transport rejected the message".to_string(),
                });
            }
            state.faults.stall_publish
        };

        if stall {
            std::future::pending::<()>().await;
        }

        self.outbox_tx
            .send(ConnectorMessage::new(target, data.to_vec()))
            .map_err(|_| ConnectorError::Closed)?;
        self.published.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    async fn publish_to_queue_sub(&self, name: &str, msg: ConnectorMessage) -> Result<()> {
        match self.queue_sub_target(name)? {
            Target::Channel(_, tx) => tx.send(msg).await.map_err(|_| closed_channel(name)),
            Target::Pull => self.pull_tx.send(msg).await.map_err(|_| closed_channel(name)),
        }
    }

    async fn receive(&self) -> Option<ConnectorMessage> {
        self.pull_rx.lock().await.recv().await
    }

    async fn close(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        info!(parent: &self.logger(), name = %state.name, "Closing connector");
        state.closed = true;
        state.connected = None;
        state.subscriptions.clear();
    }
}

/// [`ConnectionManager`] handing out a single [`MemoryConnector`]
///
/// Repeated `new_connector` calls return the same connector; it is re-dialed
/// when it is not connected.
#[derive(Default)]
pub struct MemoryConnectionManager {
    connector: Mutex<Option<Arc<MemoryConnector>>>,
    calls: AtomicUsize,
}

impl MemoryConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the manager so tests hold a handle to the connector it returns
    pub fn with_connector(connector: Arc<MemoryConnector>) -> Self {
        Self {
            connector: Mutex::new(Some(connector)),
            calls: AtomicUsize::new(0),
        }
    }

    /// The connector created (or seeded) so far
    pub fn connector(&self) -> Option<Arc<MemoryConnector>> {
        self.connector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `new_connector` calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionManager for MemoryConnectionManager {
    async fn new_connector(
        &self,
        servers: ServerResolver,
        name: &str,
        logger: Span,
    ) -> Result<Arc<dyn Connector>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let (connector, reused) = {
            let mut slot = self.connector.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(existing) => (existing.clone(), true),
                None => {
                    let created = Arc::new(MemoryConnector::new(name));
                    *slot = Some(created.clone());
                    (created, false)
                }
            }
        };

        if reused {
            debug!(parent: &logger, name, "Reusing existing connector");
        }

        connector.set_logger(logger);
        connector.set_name(name);
        connector.set_servers(servers);

        if !connector.is_connected() {
            connector.connect().await?;
        }

        Ok(connector as Arc<dyn Connector>)
    }
}
