//! Broker status state machine
//!
//! The externally visible status is never set directly. It is derived from
//! the broker's phase and the health of both sides every time one of them
//! changes, so the status and the facts it summarizes cannot disagree.
//!
//! # States
//!
//! ```text
//!                    ┌─────────────┐
//!         new() ───> │   Unknown   │ <── initial connect failed
//!                    └──────┬──────┘
//!                           │ start()
//!                    ┌──────▼──────┐
//!                    │ Connecting  │
//!                    └──────┬──────┘
//!                           │ both sides up, all routes relaying
//!                    ┌──────▼──────┐   side lost / relay ended   ┌──────────┐
//!                    │   Running   │ ──────────────────────────> │ Degraded │
//!                    │             │ <────────────────────────── │          │
//!                    └──────┬──────┘          recovered          └────┬─────┘
//!                           │ shutdown()                              │
//!                    ┌──────▼──────┐                                  │
//!                    │   Stopped   │ <────────────────────────────────┘
//!                    └─────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use federation_broker::lifecycle::{Lifecycle, Phase, Status};
//! use federation_broker::routes::Side;
//!
//! let mut lifecycle = Lifecycle::new();
//! assert_eq!(lifecycle.status(), Status::Unknown);
//!
//! lifecycle.set_phase(Phase::Started);
//! assert_eq!(lifecycle.status(), Status::Connecting);
//!
//! lifecycle.set_side(Side::Collective, true);
//! lifecycle.set_side(Side::Federation, true);
//! assert_eq!(lifecycle.status(), Status::Running);
//!
//! lifecycle.set_side(Side::Federation, false);
//! assert_eq!(lifecycle.status(), Status::Degraded);
//! ```

use crate::routes::Side;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Number of status transitions kept for inspection
pub const HISTORY_LIMIT: usize = 64;

/// Externally visible broker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Not started, or never managed to reach both networks
    Unknown,

    /// Started, establishing connections and subscriptions
    Connecting,

    /// Both sides connected and every route relaying
    Running,

    /// Was running, but a side or a route is currently down
    Degraded,

    /// Shut down; terminal
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Connecting => "connecting",
            Status::Running => "running",
            Status::Degraded => "degraded",
            Status::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse broker phase driven by `start()` and `shutdown()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Started,
    Stopped,
}

/// A recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: Status,
    pub to: Status,
    pub at: DateTime<Utc>,
}

/// Phase and health facts plus the status derived from them
#[derive(Debug, Clone)]
pub struct Lifecycle {
    phase: Phase,
    status: Status,
    collective_up: bool,
    federation_up: bool,
    failed_routes: BTreeSet<String>,
    connect_failed: bool,
    ever_running: bool,
    history: VecDeque<StatusTransition>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            status: Status::Unknown,
            collective_up: false,
            federation_up: false,
            failed_routes: BTreeSet::new(),
            connect_failed: false,
            ever_running: false,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Both sides connected and no route waiting to be re-established
    pub fn is_healthy(&self) -> bool {
        self.collective_up && self.federation_up && self.failed_routes.is_empty()
    }

    pub fn is_side_up(&self, side: Side) -> bool {
        match side {
            Side::Collective => self.collective_up,
            Side::Federation => self.federation_up,
        }
    }

    /// Stopped is terminal; later phase changes are ignored
    pub fn set_phase(&mut self, phase: Phase) -> Option<StatusTransition> {
        if self.phase == Phase::Stopped {
            return None;
        }
        self.phase = phase;
        self.recompute()
    }

    pub fn set_side(&mut self, side: Side, up: bool) -> Option<StatusTransition> {
        match side {
            Side::Collective => self.collective_up = up,
            Side::Federation => self.federation_up = up,
        }
        self.recompute()
    }

    /// An initial connection attempt did not succeed
    pub fn mark_connect_failed(&mut self) -> Option<StatusTransition> {
        self.connect_failed = true;
        self.recompute()
    }

    pub fn route_failed(&mut self, route: &str) -> Option<StatusTransition> {
        self.failed_routes.insert(route.to_string());
        self.recompute()
    }

    pub fn route_restored(&mut self, route: &str) -> Option<StatusTransition> {
        self.failed_routes.remove(route);
        self.recompute()
    }

    /// Routes currently waiting to be re-established
    pub fn failed_routes(&self) -> Vec<String> {
        self.failed_routes.iter().cloned().collect()
    }

    /// Oldest first
    pub fn history(&self) -> Vec<StatusTransition> {
        self.history.iter().cloned().collect()
    }

    fn derive(&self) -> Status {
        match self.phase {
            Phase::Idle => Status::Unknown,
            Phase::Stopped => Status::Stopped,
            Phase::Started if self.is_healthy() => Status::Running,
            Phase::Started if self.ever_running => Status::Degraded,
            Phase::Started if self.connect_failed => Status::Unknown,
            Phase::Started => Status::Connecting,
        }
    }

    fn recompute(&mut self) -> Option<StatusTransition> {
        let next = self.derive();
        if next == Status::Running {
            self.ever_running = true;
        }
        if next == self.status {
            return None;
        }

        let transition = StatusTransition {
            from: self.status,
            to: next,
            at: Utc::now(),
        };
        self.status = next;

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        Some(transition)
    }
}
