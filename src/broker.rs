//! Federation broker: bridges a collective network and a federation network
//!
//! # Architecture
//!
//! ```text
//!   collective connector ──┐                         ┌── federation connector
//!                          │  ┌───────────────────┐  │
//!   SideMonitor ───events──┼─>│    Supervisor     │<─┼──events── SideMonitor
//!                          │  │ registries+router │  │
//!                          │  └─────────┬─────────┘  │
//!                          │            │ spawns     │
//!                          └──── relay tasks (one per route) ────┘
//! ```
//!
//! `start()` connects both sides once inline, installs every route and then
//! hands ownership of the registries and the router to a supervisor task.
//! The monitors report connection changes to the supervisor, which rebuilds
//! subscriptions and restarts relays. Status is derived in the stats handle
//! from those facts and can be read at any time.
//!
//! # Example
//!
//! ```
//! use federation_broker::{BrokerConfig, ConnectionManagers, FederationBroker, Status};
//! use fedbroker_core_interface::MemoryConnectionManager;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let mut config = BrokerConfig::default();
//! config.collective.servers = vec!["nats://collective.example.net:4222".to_string()];
//! config.federation.servers = vec!["nats://federation.example.net:4222".to_string()];
//!
//! let managers = ConnectionManagers::new(
//!     Arc::new(MemoryConnectionManager::new()),
//!     Arc::new(MemoryConnectionManager::new()),
//! );
//!
//! let broker = FederationBroker::new("dc1", config, managers)?;
//! assert_eq!(broker.stats().status, Status::Unknown);
//!
//! broker.start().await?;
//! assert!(broker.wait_for_status(Status::Running, Duration::from_secs(5)).await);
//!
//! broker.shutdown().await;
//! assert_eq!(broker.stats().status, Status::Stopped);
//! # Ok::<(), federation_broker::BrokerError>(())
//! # }).unwrap();
//! ```

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::lifecycle::{Phase, Status, StatusTransition};
use crate::monitor::{MonitorEvent, SideMonitor};
use crate::registry::SubscriptionRegistry;
use crate::router::{Router, RouterEvent};
use crate::routes::{federation_prefix, validate_routes, Route, Side};
use crate::stats::{Stats, StatsHandle};
use fedbroker_core_interface::{
    validate_subject, ConnectionManager, Connector, ConnectorError, ServerResolver,
};
use fedbroker_core_resilience::{Backoff, BackoffConfig};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Connection managers for both sides
#[derive(Clone)]
pub struct ConnectionManagers {
    pub collective: Arc<dyn ConnectionManager>,
    pub federation: Arc<dyn ConnectionManager>,
}

impl ConnectionManagers {
    pub fn new(
        collective: Arc<dyn ConnectionManager>,
        federation: Arc<dyn ConnectionManager>,
    ) -> Self {
        Self {
            collective,
            federation,
        }
    }

    pub fn get(&self, side: Side) -> &Arc<dyn ConnectionManager> {
        match side {
            Side::Collective => &self.collective,
            Side::Federation => &self.federation,
        }
    }
}

/// Requests handled by the supervisor task
enum Command {
    UpdateRoutes {
        routes: Vec<Route>,
        reply: oneshot::Sender<()>,
    },
    Subscriptions {
        side: Side,
        reply: oneshot::Sender<Vec<String>>,
    },
    RetryRoute {
        route: String,
    },
}

enum RunState {
    Idle,
    Running {
        commands: mpsc::UnboundedSender<Command>,
        supervisor: JoinHandle<Supervisor>,
        monitors: Vec<JoinHandle<()>>,
    },
    Stopped,
}

struct Inner {
    state: RunState,
    routes: Vec<Route>,
    resolvers: HashMap<Side, ServerResolver>,
}

/// Cluster names must be non-empty and yield valid, wildcard-free subjects
pub fn validate_cluster(cluster: &str) -> Result<()> {
    if cluster.is_empty() {
        return Err(BrokerError::Configuration(
            "cluster name must not be empty".to_string(),
        ));
    }

    let prefix = federation_prefix(cluster, Side::Federation);
    if cluster.contains(['*', '>']) || validate_subject(&prefix).is_err() {
        return Err(BrokerError::Configuration(format!(
            "cluster name '{}' does not form a valid subject",
            cluster
        )));
    }
    Ok(())
}

pub struct FederationBroker {
    cluster: String,
    config: BrokerConfig,
    managers: ConnectionManagers,
    stats: StatsHandle,
    cancel: CancellationToken,
    span: Span,
    inner: Mutex<Inner>,
}

impl FederationBroker {
    /// Create a broker for `cluster`
    ///
    /// Validates the cluster name and the configuration. Nothing is
    /// connected until [`FederationBroker::start`].
    pub fn new(cluster: &str, config: BrokerConfig, managers: ConnectionManagers) -> Result<Self> {
        validate_cluster(cluster)?;
        config.validate()?;

        let mut resolvers = HashMap::new();
        for side in Side::ALL {
            resolvers.insert(side, config.resolver(side)?);
        }

        let routes = config.routes_for(cluster);
        let span = info_span!("federation_broker", cluster = %cluster);
        let stats = StatsHandle::new(span.clone());

        debug!(parent: &span, routes = routes.len(), "Federation broker created");

        Ok(Self {
            cluster: cluster.to_string(),
            config,
            managers,
            stats,
            cancel: CancellationToken::new(),
            span,
            inner: Mutex::new(Inner {
                state: RunState::Idle,
                routes,
                resolvers,
            }),
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Replace the server resolver of a side; only before `start()`
    pub async fn set_servers(&self, side: Side, resolver: ServerResolver) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, RunState::Idle) {
            return Err(BrokerError::Lifecycle(
                "servers can only be changed before start".to_string(),
            ));
        }
        inner.resolvers.insert(side, resolver);
        Ok(())
    }

    /// Connect both sides, install routes and start relaying
    ///
    /// A side that cannot be reached is not an error: it is retried in the
    /// background and shows up in the status.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            RunState::Idle => {}
            RunState::Running { .. } => {
                return Err(BrokerError::Lifecycle("broker already started".to_string()))
            }
            RunState::Stopped => {
                return Err(BrokerError::Lifecycle("broker has been shut down".to_string()))
            }
        }
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Lifecycle("broker is shutting down".to_string()));
        }

        info!(
            parent: &self.span,
            "🚀 Starting federation broker | Routes: {} | Capacity: {}",
            inner.routes.len(),
            self.config.channel_capacity
        );

        let routes: Vec<Arc<Route>> = inner.routes.iter().cloned().map(Arc::new).collect();
        // Routes count as down until their relay runs
        for route in &routes {
            self.stats.route_failed(&route.name);
        }
        self.stats.set_phase(Phase::Started);

        let mut connectors: HashMap<Side, Arc<dyn Connector>> = HashMap::new();
        for side in Side::ALL {
            let Some(resolver) = inner.resolvers.get(&side).cloned() else {
                continue;
            };
            match self.connect_side(side, resolver).await {
                Ok(connector) => {
                    let server = connector.connected_server();
                    info!(parent: &self.span, server = %server, "✅ Connected to {} side", side);
                    self.stats.side_connected(side, server);
                    connectors.insert(side, connector);
                }
                Err(e) => {
                    warn!(
                        parent: &self.span,
                        error = %e,
                        "⚠️  Initial connection to {} side failed, retrying in background",
                        side
                    );
                    self.stats.connect_failed();
                }
            }
        }

        if self.cancel.is_cancelled() {
            for connector in connectors.values() {
                connector.close().await;
            }
            return Err(BrokerError::Lifecycle(
                "broker was shut down while starting".to_string(),
            ));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        let (router_tx, router_rx) = mpsc::unbounded_channel();

        let router = Router::new(
            self.stats.clone(),
            self.config.publish_timeout(),
            self.cancel.child_token(),
            router_tx,
            self.span.clone(),
        );

        let mut supervisor = Supervisor {
            routes,
            connectors: connectors.clone(),
            registries: HashMap::new(),
            router,
            stats: self.stats.clone(),
            capacity: self.config.channel_capacity,
            backoff: self.config.backoff(),
            retries: HashMap::new(),
            pending_retries: HashSet::new(),
            commands: command_tx.clone(),
            command_rx,
            monitor_rx,
            router_rx,
            cancel: self.cancel.clone(),
            span: self.span.clone(),
        };
        for (side, connector) in &connectors {
            supervisor.add_registry(*side, connector.clone());
        }
        supervisor.reconcile().await;

        let supervisor = tokio::spawn(supervisor.run());

        let mut monitors = Vec::with_capacity(Side::ALL.len());
        for side in Side::ALL {
            let Some(resolver) = inner.resolvers.get(&side).cloned() else {
                continue;
            };
            let monitor = SideMonitor::new(
                side,
                self.config.connector_name(side, &self.cluster),
                self.managers.get(side).clone(),
                resolver,
                connectors.get(&side).cloned(),
                self.stats.clone(),
                self.config.backoff(),
                self.config.health_interval(),
                self.cancel.clone(),
                monitor_tx.clone(),
                self.connection_span(side),
            );
            let span = info_span!(parent: &self.span, "monitor", side = %side);
            monitors.push(tokio::spawn(monitor.run().instrument(span)));
        }

        inner.state = RunState::Running {
            commands: command_tx,
            supervisor,
            monitors,
        };

        info!(parent: &self.span, status = %self.stats.status(), "Federation broker started");
        Ok(())
    }

    /// Consistent snapshot of status, start time and per-side figures
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Wait until the broker reports `status`; false on timeout
    pub async fn wait_for_status(&self, status: Status, timeout: Duration) -> bool {
        self.stats.wait_for_status(status, timeout).await
    }

    /// Recent status transitions, oldest first
    pub fn status_history(&self) -> Vec<StatusTransition> {
        self.stats.history()
    }

    /// Replace the route set
    ///
    /// Routes that disappeared or changed are torn down, new ones are
    /// installed, unchanged ones keep relaying. An empty list stops all
    /// relaying.
    pub async fn update_routes(&self, routes: Vec<Route>) -> Result<()> {
        validate_routes(&routes).map_err(BrokerError::Configuration)?;

        let commands = {
            let mut inner = self.inner.lock().await;
            let commands = match &inner.state {
                RunState::Idle => None,
                RunState::Running { commands, .. } => Some(commands.clone()),
                RunState::Stopped => {
                    return Err(BrokerError::Lifecycle(
                        "broker has been shut down".to_string(),
                    ))
                }
            };
            inner.routes = routes.clone();
            commands
        };

        // The lock is released before waiting so shutdown can always proceed
        let Some(commands) = commands else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        commands
            .send(Command::UpdateRoutes { routes, reply })
            .map_err(|_| supervisor_gone())?;
        done.await.map_err(|_| supervisor_gone())
    }

    /// Names of the active subscriptions on `side`, sorted
    pub async fn subscriptions(&self, side: Side) -> Vec<String> {
        let commands = {
            let inner = self.inner.lock().await;
            let RunState::Running { commands, .. } = &inner.state else {
                return Vec::new();
            };
            commands.clone()
        };

        let (reply, names) = oneshot::channel();
        if commands.send(Command::Subscriptions { side, reply }).is_err() {
            return Vec::new();
        }
        names.await.unwrap_or_default()
    }

    /// Stop relaying, drop all subscriptions and close both connectors
    ///
    /// Safe to call more than once and from any state.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let mut inner = self.inner.lock().await;
        let state = std::mem::replace(&mut inner.state, RunState::Stopped);

        match state {
            RunState::Stopped => return,
            RunState::Idle => {}
            RunState::Running {
                commands,
                supervisor,
                monitors,
            } => {
                drop(commands);
                info!(parent: &self.span, "🛑 Shutting down federation broker");

                for result in futures::future::join_all(monitors).await {
                    if let Err(e) = result {
                        warn!(parent: &self.span, error = %e, "Monitor task failed");
                    }
                }

                match supervisor.await {
                    Ok(supervisor) => supervisor.teardown().await,
                    Err(e) => error!(parent: &self.span, error = %e, "Supervisor task failed"),
                }
            }
        }

        self.stats.set_phase(Phase::Stopped);
        for side in Side::ALL {
            self.stats.side_lost(side);
            self.stats.set_subscription_count(side, 0);
        }

        info!(parent: &self.span, "Federation broker stopped");
    }

    async fn connect_side(
        &self,
        side: Side,
        resolver: ServerResolver,
    ) -> Result<Arc<dyn Connector>> {
        let name = self.config.connector_name(side, &self.cluster);
        let manager = self.managers.get(side);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BrokerError::Connection {
                side,
                source: ConnectorError::Closed,
            }),
            result = manager.new_connector(resolver, &name, self.connection_span(side)) => {
                result.map_err(|source| BrokerError::Connection { side, source })
            }
        }
    }

    fn connection_span(&self, side: Side) -> Span {
        info_span!(parent: &self.span, "connection", side = %side)
    }
}

fn supervisor_gone() -> BrokerError {
    BrokerError::Lifecycle("broker is shutting down".to_string())
}

/// Sole owner of the registries and the router once the broker runs
struct Supervisor {
    routes: Vec<Arc<Route>>,
    connectors: HashMap<Side, Arc<dyn Connector>>,
    registries: HashMap<Side, SubscriptionRegistry>,
    router: Router,
    stats: StatsHandle,
    capacity: usize,
    backoff: BackoffConfig,
    retries: HashMap<String, Backoff>,
    pending_retries: HashSet<String>,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    monitor_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    router_rx: mpsc::UnboundedReceiver<RouterEvent>,
    cancel: CancellationToken,
    span: Span,
}

impl Supervisor {
    /// Process events until the broker is cancelled, then hand itself back
    async fn run(mut self) -> Self {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = self.monitor_rx.recv() => self.on_monitor_event(event).await,
                Some(event) = self.router_rx.recv() => self.on_router_event(event).await,
                Some(command) = self.command_rx.recv() => self.on_command(command).await,
            }
        }

        // Pending callers see the broker as gone instead of waiting forever
        self.command_rx.close();
        while let Ok(command) = self.command_rx.try_recv() {
            drop(command);
        }
        self
    }

    fn add_registry(&mut self, side: Side, connector: Arc<dyn Connector>) {
        let span = self.span.clone();
        self.registries
            .entry(side)
            .or_insert_with(|| SubscriptionRegistry::new(side, connector, span));
    }

    fn is_connected(&self, side: Side) -> bool {
        self.connectors
            .get(&side)
            .map(|connector| connector.is_connected())
            .unwrap_or(false)
    }

    async fn on_monitor_event(&mut self, event: MonitorEvent) {
        debug!(parent: &self.span, ?event, "Connection event");

        match event {
            MonitorEvent::Connected { side, connector } => {
                self.connectors.insert(side, connector.clone());
                self.add_registry(side, connector);
                self.reconcile().await;
            }
            MonitorEvent::Disconnected { side } => {
                let stopped = self.router.stop_relays_from(side).await;
                for route in self.routes.iter().filter(|r| r.source == side) {
                    self.stats.route_failed(&route.name);
                }
                info!(
                    parent: &self.span,
                    relays = stopped.len(),
                    "Paused relays from {} side until it reconnects",
                    side
                );
            }
            MonitorEvent::Reconnected { side } => {
                let connector = self.connectors.get(&side).cloned();
                if let (Some(registry), Some(connector)) =
                    (self.registries.get_mut(&side), connector)
                {
                    let failed = registry.rebuild(connector).await;
                    self.stats.set_subscription_count(side, registry.len());
                    for spec in &failed {
                        self.stats.route_failed(&spec.name);
                    }
                }
                self.reconcile().await;
            }
        }
    }

    async fn on_router_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::RelayEnded { route, source } => {
                self.stats.route_failed(&route);
                // The transport may restore its session between two health polls
                debug!(
                    parent: &self.span,
                    route = %route,
                    connected = self.is_connected(source),
                    "Relay ended, scheduling resubscribe"
                );
                self.schedule_retry(&route);
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::UpdateRoutes { routes, reply } => {
                self.update_routes(routes).await;
                let _ = reply.send(());
            }
            Command::Subscriptions { side, reply } => {
                let names = self
                    .registries
                    .get(&side)
                    .map(SubscriptionRegistry::list)
                    .unwrap_or_default();
                let _ = reply.send(names);
            }
            Command::RetryRoute { route } => {
                self.pending_retries.remove(&route);
                self.retry_route(&route).await
            }
        }
    }

    /// Install every route that is not relaying yet
    async fn reconcile(&mut self) {
        for route in self.routes.clone() {
            if let Err(e) = self.install_route(&route).await {
                debug!(parent: &self.span, route = %route.name, error = %e, "Route not installed");
                if matches!(e, BrokerError::Subscription { .. }) {
                    self.schedule_retry(&route.name);
                }
            }
        }
    }

    /// Subscribe the route's source side and start its relay
    async fn install_route(&mut self, route: &Arc<Route>) -> Result<()> {
        let span = self.span.clone();
        let source = route.source;
        let target = route.destination_side();

        let not_connected = |side| BrokerError::Connection {
            side,
            source: ConnectorError::NotConnected,
        };

        let Some(destination) = self.connectors.get(&target).cloned() else {
            self.stats.route_failed(&route.name);
            return Err(not_connected(target));
        };
        let Some(registry) = self.registries.get_mut(&source) else {
            self.stats.route_failed(&route.name);
            return Err(not_connected(source));
        };
        if !registry.connector().is_connected() {
            self.stats.route_failed(&route.name);
            return Err(not_connected(source));
        }

        // A relay that ended on its own was reading a closed channel
        if self.router.has_ended(&route.name) {
            if let Err(e) = registry.remove(&route.name).await {
                debug!(parent: &span, route = %route.name, error = %e, "Stale subscription not removed");
            }
        }

        let delivery = match registry
            .add(&route.name, &route.subject, &route.group, self.capacity)
            .await
        {
            Ok(delivery) => delivery,
            Err(e) => {
                self.stats.route_failed(&route.name);
                return Err(e);
            }
        };
        self.stats.set_subscription_count(source, registry.len());

        self.router.start_relay(route.clone(), delivery, destination).await;
        self.retries.remove(&route.name);
        self.stats.route_restored(&route.name);

        Ok(())
    }

    async fn retry_route(&mut self, name: &str) {
        let Some(route) = self.routes.iter().find(|r| r.name == name).cloned() else {
            self.retries.remove(name);
            return;
        };
        if !self.stats.failed_routes().iter().any(|failed| failed == name) {
            self.retries.remove(name);
            return;
        }

        match self.install_route(&route).await {
            Ok(()) => info!(parent: &self.span, route = name, "🔁 Route restored"),
            Err(e) => {
                warn!(parent: &self.span, route = name, error = %e, "Route still down");
                if e.is_transient() {
                    self.schedule_retry(name);
                }
            }
        }
    }

    /// At most one retry timer is pending per route
    fn schedule_retry(&mut self, name: &str) {
        if self.pending_retries.contains(name) {
            return;
        }

        let span = self.span.clone();
        let config = &self.backoff;
        let backoff = self
            .retries
            .entry(name.to_string())
            .or_insert_with(|| Backoff::new(config.clone()));

        let Some(delay) = backoff.next_delay() else {
            error!(parent: &span, route = name, "❌ Giving up on route after {} retries", backoff.retries());
            return;
        };

        debug!(parent: &span, route = name, delay_ms = delay.as_millis() as u64, "Scheduling route retry");
        self.pending_retries.insert(name.to_string());

        let commands = self.commands.clone();
        let cancel = self.cancel.clone();
        let route = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::RetryRoute { route });
                }
            }
        });
    }

    async fn update_routes(&mut self, routes: Vec<Route>) {
        let next: Vec<Arc<Route>> = routes.into_iter().map(Arc::new).collect();

        for old in self.routes.clone() {
            if !next.iter().any(|route| route.as_ref() == old.as_ref()) {
                self.remove_route(&old).await;
            }
        }

        self.routes = next;
        self.reconcile().await;

        info!(parent: &self.span, routes = self.routes.len(), "Routes updated");
    }

    async fn remove_route(&mut self, route: &Route) {
        let span = self.span.clone();
        self.router.stop_relay(&route.name).await;

        if let Some(registry) = self.registries.get_mut(&route.source) {
            if let Err(e) = registry.remove(&route.name).await {
                warn!(parent: &span, route = %route.name, error = %e, "Unsubscribe failed");
            }
            self.stats.set_subscription_count(route.source, registry.len());
        }

        self.retries.remove(&route.name);
        self.stats.route_restored(&route.name);
        debug!(parent: &span, route = %route.name, "Route removed");
    }

    /// Stop relays, drop subscriptions and close every connector
    async fn teardown(mut self) {
        self.router.shutdown().await;

        for registry in self.registries.values_mut() {
            registry.clear().await;
        }

        // Connectors a monitor acquired after cancellation never reached the loop
        while let Ok(event) = self.monitor_rx.try_recv() {
            if let MonitorEvent::Connected { side, connector } = event {
                self.connectors.insert(side, connector);
            }
        }

        for (side, connector) in &self.connectors {
            connector.close().await;
            debug!(parent: &self.span, "Closed {} connector", side);
        }
    }
}
