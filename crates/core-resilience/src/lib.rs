//! Federation Broker Core Resilience: pure-logic retry primitives
//!
//! # Overview
//!
//! The broker never retries a relayed message, but it does retry the things
//! that keep the bridge up: dialing a side, re-dialing after a lost session,
//! and re-installing subscriptions the transport rejected. This crate holds
//! the building blocks for that:
//!
//! - **Backoff**: exponential delays with a cap, jitter and an optional attempt limit
//! - **Retry**: a cancellable loop that sleeps between attempts
//! - **Timeout**: bound a future by a deadline *and* a shutdown signal
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of transports, subjects
//! or broker state. Cancellation is expressed with
//! [`tokio_util::sync::CancellationToken`] so that a broker shutdown unblocks
//! every waiting caller.
//!
//! ```text
//!   attempt ──fail──> Backoff::next_delay ──> sleep ─┐
//!      ▲                     │ exhausted             │ cancelled
//!      └──────────────────── │ ──────────────────────┤
//!                            ▼                       ▼
//!                   RetriesExhausted            Cancelled
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use fedbroker_core_resilience::{retry_with_backoff, BackoffConfig, ResilienceError};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let cancel = CancellationToken::new();
//! let config = BackoffConfig::default();
//!
//! let value = retry_with_backoff("dial collective", &config, &cancel, |attempt| async move {
//!     if attempt < 3 {
//!         Err("not yet")
//!     } else {
//!         Ok(attempt)
//!     }
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod error;
pub mod retry;

pub use backoff::{Backoff, BackoffConfig};
pub use error::ResilienceError;
pub use retry::{retry_with_backoff, with_timeout};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::backoff::{Backoff, BackoffConfig};
    pub use super::error::ResilienceError;
    pub use super::retry::{retry_with_backoff, with_timeout};
}
