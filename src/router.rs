//! Relay tasks moving messages from one side to the other
//!
//! Each active route owns one task. The task takes messages off the route's
//! delivery channel in order, maps the subject with the route's target and
//! publishes on the opposite side's connector. A publish is bounded by the
//! configured timeout and by the shutdown token; failures are counted and the
//! message is dropped, so delivery is at most once.

use crate::error::BrokerError;
use crate::routes::{Destination, Route, Side};
use crate::stats::StatsHandle;
use fedbroker_core_interface::{Connector, ConnectorMessage, Delivery};
use fedbroker_core_resilience::{with_timeout, ResilienceError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument, Span};

/// Notifications from relay tasks to their owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// The route's source channel closed while the relay was still wanted
    RelayEnded { route: String, source: Side },
}

struct RelayHandle {
    source: Side,
    delivery: Delivery,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct RelayContext {
    stats: StatsHandle,
    publish_timeout: Duration,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<RouterEvent>,
}

pub struct Router {
    relays: HashMap<String, RelayHandle>,
    stats: StatsHandle,
    publish_timeout: Duration,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<RouterEvent>,
    span: Span,
}

impl Router {
    /// Relay tokens are children of `cancel`
    pub fn new(
        stats: StatsHandle,
        publish_timeout: Duration,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<RouterEvent>,
        span: Span,
    ) -> Self {
        Self {
            relays: HashMap::new(),
            stats,
            publish_timeout,
            cancel,
            events,
            span,
        }
    }

    /// Start relaying `route` from `delivery` onto `destination`
    ///
    /// A relay already running on the same channel is left alone; one on a
    /// different channel is stopped first.
    pub async fn start_relay(
        &mut self,
        route: Arc<Route>,
        delivery: Delivery,
        destination: Arc<dyn Connector>,
    ) {
        if let Some(existing) = self.relays.get(&route.name) {
            if existing.delivery.same_channel(&delivery) && !existing.task.is_finished() {
                return;
            }
            self.stop_relay(&route.name).await;
        }

        let cancel = self.cancel.child_token();
        let ctx = RelayContext {
            stats: self.stats.clone(),
            publish_timeout: self.publish_timeout,
            cancel: cancel.clone(),
            events: self.events.clone(),
        };
        let span = info_span!(parent: &self.span, "relay", route = %route.name);

        debug!(
            parent: &self.span,
            route = %route.name,
            from = %route.source,
            to = %route.destination_side(),
            "Starting relay"
        );

        let task = tokio::spawn(
            relay(route.clone(), delivery.clone(), destination, ctx).instrument(span),
        );

        self.relays.insert(
            route.name.clone(),
            RelayHandle {
                source: route.source,
                delivery,
                cancel,
                task,
            },
        );
    }

    /// Stop and join one relay; false if it was not running
    pub async fn stop_relay(&mut self, name: &str) -> bool {
        let Some(handle) = self.relays.remove(name) else {
            return false;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(parent: &self.span, route = name, error = %e, "Relay task failed");
        }
        true
    }

    /// Stop every relay consuming from `side`
    pub async fn stop_relays_from(&mut self, side: Side) -> Vec<String> {
        let names: Vec<String> = self
            .relays
            .iter()
            .filter(|(_, handle)| handle.source == side)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &names {
            self.stop_relay(name).await;
        }
        names
    }

    /// True when the relay for `name` exited because its channel closed
    pub fn has_ended(&self, name: &str) -> bool {
        self.relays
            .get(name)
            .map(|handle| handle.task.is_finished())
            .unwrap_or(false)
    }

    /// Names of running relays, sorted
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.relays.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every relay and wait for all of them to finish
    pub async fn shutdown(&mut self) {
        let handles: Vec<(String, RelayHandle)> = self.relays.drain().collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }

        let results = futures::future::join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { (name, handle.task.await) }),
        )
        .await;

        for (name, result) in results {
            if let Err(e) = result {
                warn!(parent: &self.span, route = %name, error = %e, "Relay task failed");
            }
        }
    }
}

async fn relay(
    route: Arc<Route>,
    delivery: Delivery,
    destination: Arc<dyn Connector>,
    ctx: RelayContext,
) {
    let source = route.source;
    let target_side = route.destination_side();

    loop {
        let msg = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            msg = delivery.recv() => msg,
        };

        let Some(msg) = msg else {
            if !ctx.cancel.is_cancelled() {
                warn!("Source subscription closed");
                let _ = ctx.events.send(RouterEvent::RelayEnded {
                    route: route.name.clone(),
                    source,
                });
            }
            break;
        };

        ctx.stats.record_received(source);

        let Some(dest) = route.destination(&msg.subject) else {
            debug!(subject = %msg.subject, "Unroutable subject, dropping");
            ctx.stats.record_unroutable(source);
            continue;
        };

        trace!(subject = %msg.subject, destination = %dest, "Relaying");

        match with_timeout(
            ctx.publish_timeout,
            &ctx.cancel,
            publish(destination.as_ref(), &dest, msg),
        )
        .await
        {
            Ok(Ok(())) => ctx.stats.record_relayed(target_side),
            Err(ResilienceError::Cancelled) => break,
            Ok(Err(e)) => publish_failed(&ctx, target_side, &dest, e.to_string()),
            Err(e) => publish_failed(&ctx, target_side, &dest, e.to_string()),
        }
    }

    debug!("Relay stopped");
}

fn publish_failed(ctx: &RelayContext, side: Side, dest: &Destination, reason: String) {
    ctx.stats.record_publish_error(side);
    let err = BrokerError::Publish {
        target: dest.to_string(),
        reason,
    };
    warn!(error = %err, "Message dropped");
}

async fn publish(
    connector: &dyn Connector,
    dest: &Destination,
    msg: ConnectorMessage,
) -> fedbroker_core_interface::Result<()> {
    match dest {
        Destination::Subject(subject) => connector.publish_raw(subject, &msg.data).await,
        Destination::QueueSub(name) => connector.publish_to_queue_sub(name, msg).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{default_routes, RouteTarget};
    use fedbroker_core_interface::{static_resolver, MemoryConnector, Server};

    struct Harness {
        router: Router,
        stats: StatsHandle,
        events: mpsc::UnboundedReceiver<RouterEvent>,
        collective: Arc<MemoryConnector>,
    }

    async fn harness(publish_timeout: Duration) -> Harness {
        let collective = Arc::new(MemoryConnector::new("collective"));
        collective.set_servers(static_resolver(vec![Server::new("nats", "c1", 4222)]));
        collective.connect().await.unwrap();

        let stats = StatsHandle::new(Span::none());
        let (tx, events) = mpsc::unbounded_channel();
        let router = Router::new(
            stats.clone(),
            publish_timeout,
            CancellationToken::new(),
            tx,
            Span::none(),
        );

        Harness {
            router,
            stats,
            events,
            collective,
        }
    }

    fn inbound_route() -> Arc<Route> {
        Arc::new(default_routes("dc1").remove(0))
    }

    fn channel(name: &str) -> (mpsc::Sender<ConnectorMessage>, Delivery) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Delivery::new(name, rx))
    }

    #[tokio::test]
    async fn test_relays_in_order_with_prefix_stripped() {
        let mut h = harness(Duration::from_secs(1)).await;
        let (tx, delivery) = channel("dc1.federation");

        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        for i in 0..5 {
            let subject = format!("choria.federation.dc1.federation.mcollective.node{}", i);
            tx.send(ConnectorMessage::new(subject, vec![i as u8])).await.unwrap();
        }

        for i in 0..5 {
            let msg = h
                .collective
                .next_published(Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(msg.subject, format!("mcollective.node{}", i));
            assert_eq!(msg.data, vec![i as u8]);
        }

        h.router.shutdown().await;
        let stats = h.stats.snapshot();
        assert_eq!(stats.federation_stats.received, 5);
        assert_eq!(stats.collective_stats.relayed, 5);
    }

    #[tokio::test]
    async fn test_unroutable_subjects_are_counted() {
        let mut h = harness(Duration::from_secs(1)).await;
        let (tx, delivery) = channel("dc1.federation");
        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        tx.send(ConnectorMessage::new("choria.federation.dc1.federation", "x"))
            .await
            .unwrap();
        tx.send(ConnectorMessage::new("choria.federation.dc1.federation.ok", "y"))
            .await
            .unwrap();

        let msg = h
            .collective
            .next_published(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(msg.subject, "ok");

        h.router.shutdown().await;
        assert_eq!(h.stats.snapshot().federation_stats.unroutable, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_drops_and_continues() {
        let mut h = harness(Duration::from_secs(1)).await;
        let (tx, delivery) = channel("dc1.federation");
        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        h.collective.set_fail_publish(true);
        tx.send(ConnectorMessage::new("choria.federation.dc1.federation.a", "1"))
            .await
            .unwrap();

        // Wait for the failure to register before letting publishes through
        for _ in 0..100 {
            if h.stats.snapshot().collective_stats.publish_errors == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.stats.snapshot().collective_stats.publish_errors, 1);

        h.collective.set_fail_publish(false);
        tx.send(ConnectorMessage::new("choria.federation.dc1.federation.b", "2"))
            .await
            .unwrap();

        let msg = h
            .collective
            .next_published(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(msg.subject, "b");
        h.router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_publish_times_out() {
        let mut h = harness(Duration::from_millis(100)).await;
        let (tx, delivery) = channel("dc1.federation");
        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        h.collective.set_stall_publish(true);
        tx.send(ConnectorMessage::new("choria.federation.dc1.federation.a", "1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.stats.snapshot().collective_stats.publish_errors, 1);
        h.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_publish() {
        let mut h = harness(Duration::from_secs(3600)).await;
        let (tx, delivery) = channel("dc1.federation");
        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        h.collective.set_stall_publish(true);
        tx.send(ConnectorMessage::new("choria.federation.dc1.federation.a", "1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), h.router.shutdown())
            .await
            .expect("shutdown must not wait for a stalled publish");
        assert!(h.router.active().is_empty());
        assert_eq!(h.collective.published_count(), 0);
    }

    #[tokio::test]
    async fn test_no_publish_after_shutdown() {
        let mut h = harness(Duration::from_secs(1)).await;
        let (tx, delivery) = channel("dc1.federation");
        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        h.router.shutdown().await;
        let _ = tx
            .send(ConnectorMessage::new("choria.federation.dc1.federation.late", "x"))
            .await;

        assert!(h
            .collective
            .next_published(Duration::from_millis(50))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_closed_source_emits_relay_ended() {
        let mut h = harness(Duration::from_secs(1)).await;
        let (tx, delivery) = channel("dc1.federation");
        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        drop(tx);
        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            RouterEvent::RelayEnded {
                route: "dc1.federation".to_string(),
                source: Side::Federation,
            }
        );
    }

    #[tokio::test]
    async fn test_stopped_relay_does_not_emit_event() {
        let mut h = harness(Duration::from_secs(1)).await;
        let (_tx, delivery) = channel("dc1.federation");
        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        assert!(h.router.stop_relay("dc1.federation").await);
        assert!(!h.router.stop_relay("dc1.federation").await);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_sub_target() {
        let mut h = harness(Duration::from_secs(1)).await;
        let local = h
            .collective
            .chan_queue_subscribe("local.inbox", "local.inbox", "", 4)
            .await
            .unwrap();

        let route = Arc::new(Route {
            name: "to_local".to_string(),
            source: Side::Federation,
            subject: "inbox.>".to_string(),
            group: String::new(),
            target: RouteTarget::QueueSub {
                name: "local.inbox".to_string(),
            },
        });
        let (tx, delivery) = channel("to_local");
        h.router.start_relay(route, delivery, h.collective.clone()).await;

        tx.send(ConnectorMessage::new("inbox.a", "payload").with_reply("reply.1"))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), local.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.subject, "inbox.a");
        assert_eq!(msg.reply.as_deref(), Some("reply.1"));
        h.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_on_same_channel_is_noop() {
        let mut h = harness(Duration::from_secs(1)).await;
        let (_tx, delivery) = channel("dc1.federation");

        h.router
            .start_relay(inbound_route(), delivery.clone(), h.collective.clone())
            .await;
        h.router
            .start_relay(inbound_route(), delivery, h.collective.clone())
            .await;

        assert_eq!(h.router.active(), vec!["dc1.federation".to_string()]);
        h.router.stop_relays_from(Side::Federation).await;
        assert!(h.router.active().is_empty());
    }
}
