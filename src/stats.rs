/*!
 * Broker statistics shared between the broker's tasks and its host
 *
 * All updates go through one `watch` channel. Every update changes the
 * counters or server string and re-derives the status in the same step, so
 * a snapshot never shows a status that contradicts its server fields.
 */

use crate::lifecycle::{Lifecycle, Phase, Status, StatusTransition};
use crate::routes::Side;
use chrono::{DateTime, Utc};
use fedbroker_core_interface::UNKNOWN_SERVER;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, Span};

/// Per-side figures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideStats {
    /// Server URL, or "unknown" while not connected
    pub connected_server: String,

    /// Messages taken off this side's subscriptions
    pub received: u64,

    /// Messages published onto this side
    pub relayed: u64,

    /// Publishes onto this side that failed or timed out
    pub publish_errors: u64,

    /// Messages from this side no route could map
    pub unroutable: u64,

    pub reconnects: u64,

    /// Active subscriptions on this side
    pub subscriptions: usize,
}

impl Default for SideStats {
    fn default() -> Self {
        Self {
            connected_server: UNKNOWN_SERVER.to_string(),
            received: 0,
            relayed: 0,
            publish_errors: 0,
            unroutable: 0,
            reconnects: 0,
            subscriptions: 0,
        }
    }
}

/// Point-in-time view of the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub status: Status,
    pub start_time: DateTime<Utc>,
    pub collective_stats: SideStats,
    pub federation_stats: SideStats,
}

impl Stats {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            status: Status::Unknown,
            start_time,
            collective_stats: SideStats::default(),
            federation_stats: SideStats::default(),
        }
    }

    pub fn side(&self, side: Side) -> &SideStats {
        match side {
            Side::Collective => &self.collective_stats,
            Side::Federation => &self.federation_stats,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut SideStats {
        match side {
            Side::Collective => &mut self.collective_stats,
            Side::Federation => &mut self.federation_stats,
        }
    }

    /// JSON document for host status endpoints
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug)]
struct StatsState {
    stats: Stats,
    lifecycle: Lifecycle,
}

/// Cloneable writer/reader for the broker's stats
#[derive(Clone)]
pub struct StatsHandle {
    tx: Arc<watch::Sender<StatsState>>,
    span: Span,
}

impl StatsHandle {
    /// Fresh stats with `start_time` fixed to now
    pub fn new(span: Span) -> Self {
        let state = StatsState {
            stats: Stats::new(Utc::now()),
            lifecycle: Lifecycle::new(),
        };
        let (tx, _) = watch::channel(state);

        Self {
            tx: Arc::new(tx),
            span,
        }
    }

    /// Consistent copy of the current stats
    pub fn snapshot(&self) -> Stats {
        self.tx.borrow().stats.clone()
    }

    pub fn status(&self) -> Status {
        self.tx.borrow().stats.status
    }

    pub fn phase(&self) -> Phase {
        self.tx.borrow().lifecycle.phase()
    }

    pub fn history(&self) -> Vec<StatusTransition> {
        self.tx.borrow().lifecycle.history()
    }

    pub fn failed_routes(&self) -> Vec<String> {
        self.tx.borrow().lifecycle.failed_routes()
    }

    /// Wait until the status equals `status`; false on timeout
    pub async fn wait_for_status(&self, status: Status, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| s.stats.status == status)).await;
        matches!(reached, Ok(Ok(_)))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.update(|state| state.lifecycle.set_phase(phase));
    }

    pub fn side_connected(&self, side: Side, server: String) {
        self.update(|state| {
            state.stats.side_mut(side).connected_server = server;
            state.lifecycle.set_side(side, true)
        });
    }

    /// Side detected disconnected; its server becomes "unknown"
    pub fn side_lost(&self, side: Side) {
        self.update(|state| {
            state.stats.side_mut(side).connected_server = UNKNOWN_SERVER.to_string();
            state.lifecycle.set_side(side, false)
        });
    }

    /// A connection attempt during `start()` did not succeed
    pub fn connect_failed(&self) {
        self.update(|state| state.lifecycle.mark_connect_failed());
    }

    pub fn route_failed(&self, route: &str) {
        self.update(|state| state.lifecycle.route_failed(route));
    }

    pub fn route_restored(&self, route: &str) {
        self.update(|state| state.lifecycle.route_restored(route));
    }

    pub fn record_received(&self, side: Side) {
        self.update_counters(|stats| stats.side_mut(side).received += 1);
    }

    pub fn record_relayed(&self, side: Side) {
        self.update_counters(|stats| stats.side_mut(side).relayed += 1);
    }

    pub fn record_publish_error(&self, side: Side) {
        self.update_counters(|stats| stats.side_mut(side).publish_errors += 1);
    }

    pub fn record_unroutable(&self, side: Side) {
        self.update_counters(|stats| stats.side_mut(side).unroutable += 1);
    }

    pub fn record_reconnect(&self, side: Side) {
        self.update_counters(|stats| stats.side_mut(side).reconnects += 1);
    }

    pub fn set_subscription_count(&self, side: Side, count: usize) {
        self.update_counters(|stats| stats.side_mut(side).subscriptions = count);
    }

    fn update_counters(&self, f: impl FnOnce(&mut Stats)) {
        self.tx.send_modify(|state| f(&mut state.stats));
    }

    fn update(&self, f: impl FnOnce(&mut StatsState) -> Option<StatusTransition>) {
        let mut transition = None;
        self.tx.send_modify(|state| {
            transition = f(state);
            state.stats.status = state.lifecycle.status();
        });

        if let Some(t) = transition {
            info!(parent: &self.span, from = %t.from, to = %t.to, "🔀 Broker status changed");
        }
    }
}
