/*!
 * Federation Broker - pub/sub relay between a collective and a federation
 *
 * Bridges request/reply traffic between the network a collective's nodes
 * live on and a federation network joining several collectives:
 * - Named, idempotent subscriptions per side, rebuilt after reconnects
 * - One ordered relay task per route with bounded, shutdown-aware publishes
 * - Background reconnects with exponential backoff and jitter
 * - Consistent status and per-side statistics for host status endpoints
 *
 * Transports are supplied by the host through the `ConnectionManager` and
 * `Connector` traits of `fedbroker-core-interface`.
 */

pub mod broker;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod routes;
pub mod stats;

// Re-export commonly used types
pub use broker::{ConnectionManagers, FederationBroker};
pub use config::{BrokerConfig, LogLevel, LoggingConfig, ReconnectConfig, SideConfig};
pub use error::{BrokerError, Result};
pub use lifecycle::{Status, StatusTransition};
pub use routes::{default_routes, Route, RouteTarget, Side};
pub use stats::{SideStats, Stats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
