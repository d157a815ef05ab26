//! Side monitor: keeps one side's connector alive
//!
//! The monitor polls the connector's health on a fixed interval. When the
//! session is lost it marks the side down in the stats, tells the
//! supervisor, and re-dials with backoff until the connection is back or the
//! broker shuts down. A side that never connected during `start()` is
//! acquired here through its connection manager.

use crate::routes::Side;
use crate::stats::StatsHandle;
use fedbroker_core_interface::{ConnectionManager, Connector, ServerResolver};
use fedbroker_core_resilience::{retry_with_backoff, BackoffConfig, ResilienceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

/// Connection changes reported to the supervisor
#[derive(Clone)]
pub enum MonitorEvent {
    /// A connector for `side` became available for the first time
    Connected {
        side: Side,
        connector: Arc<dyn Connector>,
    },
    /// The session on `side` was lost
    Disconnected { side: Side },
    /// The session on `side` is back; subscriptions must be rebuilt
    Reconnected { side: Side },
}

impl std::fmt::Debug for MonitorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorEvent::Connected { side, connector } => f
                .debug_struct("Connected")
                .field("side", side)
                .field("connector", &connector.name())
                .finish(),
            MonitorEvent::Disconnected { side } => {
                f.debug_struct("Disconnected").field("side", side).finish()
            }
            MonitorEvent::Reconnected { side } => {
                f.debug_struct("Reconnected").field("side", side).finish()
            }
        }
    }
}

pub struct SideMonitor {
    side: Side,
    name: String,
    manager: Arc<dyn ConnectionManager>,
    resolver: ServerResolver,
    connector: Option<Arc<dyn Connector>>,
    stats: StatsHandle,
    backoff: BackoffConfig,
    interval: Duration,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<MonitorEvent>,
    /// Span handed to the connection manager as the connector's logger
    connection_span: Span,
}

impl SideMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        side: Side,
        name: String,
        manager: Arc<dyn ConnectionManager>,
        resolver: ServerResolver,
        connector: Option<Arc<dyn Connector>>,
        stats: StatsHandle,
        backoff: BackoffConfig,
        interval: Duration,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<MonitorEvent>,
        connection_span: Span,
    ) -> Self {
        Self {
            side,
            name,
            manager,
            resolver,
            connector,
            stats,
            backoff,
            interval,
            cancel,
            events,
            connection_span,
        }
    }

    /// Run until cancelled or until reconnecting gives up
    pub async fn run(mut self) {
        let connector = match self.connector.take() {
            Some(connector) => connector,
            None => match self.acquire().await {
                Some(connector) => connector,
                None => return,
            },
        };

        loop {
            if !self.watch(&connector).await {
                return;
            }

            warn!("📉 Connection on {} side lost", self.side);
            self.stats.side_lost(self.side);
            let _ = self.events.send(MonitorEvent::Disconnected { side: self.side });

            if !self.reconnect(&connector).await {
                return;
            }
        }
    }

    /// Obtain a connector through the manager, retrying with backoff
    async fn acquire(&self) -> Option<Arc<dyn Connector>> {
        let operation = format!("connect {}", self.side);
        let result = retry_with_backoff(&operation, &self.backoff, &self.cancel, |_| {
            let manager = self.manager.clone();
            let resolver = self.resolver.clone();
            let name = self.name.clone();
            let span = self.connection_span.clone();
            async move { manager.new_connector(resolver, &name, span).await }
        })
        .await;

        match result {
            Ok(connector) => {
                let server = connector.connected_server();
                info!(server = %server, "✅ Connected to {} side", self.side);
                self.stats.side_connected(self.side, server);
                let _ = self.events.send(MonitorEvent::Connected {
                    side: self.side,
                    connector: connector.clone(),
                });
                Some(connector)
            }
            Err(ResilienceError::Cancelled) => None,
            Err(e) => {
                error!(error = %e, "❌ Giving up connecting to {} side", self.side);
                None
            }
        }
    }

    /// Poll until the session is lost (true) or the broker stops (false)
    async fn watch(&self, connector: &Arc<dyn Connector>) -> bool {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_server = connector.connected_server();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = ticker.tick() => {}
            }

            if !connector.is_connected() {
                return true;
            }

            // Transports may fail over to another server on their own
            let server = connector.connected_server();
            if server != last_server {
                debug!(from = %last_server, to = %server, "Server changed");
                self.stats.side_connected(self.side, server.clone());
                last_server = server;
            }
        }
    }

    /// Re-dial until connected (true) or the broker stops (false)
    async fn reconnect(&self, connector: &Arc<dyn Connector>) -> bool {
        let operation = format!("reconnect {}", self.side);
        let result = retry_with_backoff(&operation, &self.backoff, &self.cancel, |_| {
            let connector = connector.clone();
            async move { connector.connect().await }
        })
        .await;

        match result {
            Ok(()) => {
                let server = connector.connected_server();
                info!(server = %server, "🔄 Reconnected to {} side", self.side);
                self.stats.record_reconnect(self.side);
                self.stats.side_connected(self.side, server);
                let _ = self.events.send(MonitorEvent::Reconnected { side: self.side });
                true
            }
            Err(ResilienceError::Cancelled) => false,
            Err(e) => {
                error!(error = %e, "❌ Giving up reconnecting to {} side", self.side);
                false
            }
        }
    }
}
