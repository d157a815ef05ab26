/*!
 * Integration tests for the federation broker
 *
 * Both sides run on in-memory connectors so the tests can inject traffic,
 * inspect what was relayed, and break connections on purpose:
 * - Initial state and start-up
 * - Relaying in both directions
 * - Start-up with an unreachable side
 * - Connection loss, degraded status and recovery
 * - Sessions restored by the transport between health polls
 * - Rejected subscriptions retried with backoff
 * - Route updates, back-pressure and shutdown
 */

use federation_broker::{
    default_routes, BrokerConfig, ConnectionManagers, FederationBroker, Route, RouteTarget, Side,
    Status,
};
use fedbroker_core_interface::{
    Connector, ConnectorError, ConnectorMessage, MemoryConnectionManager, MemoryConnector,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    broker: Arc<FederationBroker>,
    collective: Arc<MemoryConnector>,
    federation: Arc<MemoryConnector>,
    federation_manager: Arc<MemoryConnectionManager>,
}

fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.collective.servers = vec!["nats://collective.example.net:4222".to_string()];
    config.federation.servers = vec!["nats://federation.example.net:4222".to_string()];
    config.health_interval_ms = 10;
    config.publish_timeout_ms = 500;
    config.reconnect.initial_ms = 10;
    config.reconnect.max_ms = 50;
    config.reconnect.jitter = 0.0;
    config
}

fn fixture_with(cluster: &str, config: BrokerConfig) -> Fixture {
    federation_broker::logging::init_test_logging();

    let collective = Arc::new(MemoryConnector::new("collective"));
    let federation = Arc::new(MemoryConnector::new("federation"));
    let collective_manager = Arc::new(MemoryConnectionManager::with_connector(collective.clone()));
    let federation_manager = Arc::new(MemoryConnectionManager::with_connector(federation.clone()));

    let broker = FederationBroker::new(
        cluster,
        config,
        ConnectionManagers::new(collective_manager, federation_manager.clone()),
    )
    .unwrap();

    Fixture {
        broker: Arc::new(broker),
        collective,
        federation,
        federation_manager,
    }
}

fn fixture(cluster: &str) -> Fixture {
    fixture_with(cluster, test_config())
}

async fn started(cluster: &str) -> Fixture {
    let f = fixture(cluster);
    f.broker.start().await.unwrap();
    assert!(f.broker.wait_for_status(Status::Running, WAIT).await);
    f
}

/// Poll `check` until it holds or the wait budget runs out
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_new_broker_reports_unknown() {
    let before = chrono::Utc::now();
    let broker = FederationBroker::new(
        "test_cluster",
        BrokerConfig::default(),
        ConnectionManagers::new(
            Arc::new(MemoryConnectionManager::new()),
            Arc::new(MemoryConnectionManager::new()),
        ),
    )
    .unwrap();

    let stats = broker.stats();
    assert_eq!(stats.status, Status::Unknown);
    assert_eq!(stats.collective_stats.connected_server, "unknown");
    assert_eq!(stats.federation_stats.connected_server, "unknown");
    assert!(stats.start_time >= before);
    assert!(chrono::Utc::now() - stats.start_time < chrono::Duration::seconds(1));

    // start_time is fixed at construction
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.stats().start_time, stats.start_time);
}

#[tokio::test]
async fn test_start_subscribes_default_routes() {
    let f = started("dc1").await;

    assert_eq!(
        f.broker.subscriptions(Side::Federation).await,
        vec!["dc1.federation".to_string()]
    );
    assert_eq!(
        f.broker.subscriptions(Side::Collective).await,
        vec!["dc1.collective".to_string()]
    );
    assert_eq!(
        f.federation.subscriptions(),
        vec![(
            "dc1.federation".to_string(),
            "choria.federation.dc1.federation.>".to_string(),
            "dc1_federation".to_string()
        )]
    );

    let stats = f.broker.stats();
    assert_eq!(
        stats.collective_stats.connected_server,
        "nats://collective.example.net:4222"
    );
    assert_eq!(
        stats.federation_stats.connected_server,
        "nats://federation.example.net:4222"
    );
    assert_eq!(stats.federation_stats.subscriptions, 1);

    let statuses: Vec<_> = f.broker.status_history().iter().map(|t| t.to).collect();
    assert_eq!(statuses, vec![Status::Connecting, Status::Running]);

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_relays_in_both_directions() {
    let f = started("dc1").await;

    let request = ConnectorMessage::new(
        "choria.federation.dc1.federation.mcollective.broadcast.agent.discovery",
        b"request".to_vec(),
    );
    assert_eq!(f.federation.inject(request).await.unwrap(), 1);

    let relayed = f.collective.next_published(WAIT).await.unwrap();
    assert_eq!(relayed.subject, "mcollective.broadcast.agent.discovery");
    assert_eq!(relayed.data, b"request".to_vec());

    let reply = ConnectorMessage::new(
        "choria.federation.dc1.collective.mcollective.reply.node1.123",
        b"reply".to_vec(),
    );
    assert_eq!(f.collective.inject(reply).await.unwrap(), 1);

    let relayed = f.federation.next_published(WAIT).await.unwrap();
    assert_eq!(relayed.subject, "mcollective.reply.node1.123");
    assert_eq!(relayed.data, b"reply".to_vec());

    let broker = f.broker.clone();
    eventually("relay counters", move || {
        let stats = broker.stats();
        stats.collective_stats.relayed == 1 && stats.federation_stats.relayed == 1
    })
    .await;

    let stats = f.broker.stats();
    assert_eq!(stats.federation_stats.received, 1);
    assert_eq!(stats.collective_stats.received, 1);

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_relay_preserves_order() {
    let f = started("dc1").await;

    for i in 0..50 {
        let subject = format!("choria.federation.dc1.federation.seq.{}", i);
        f.federation
            .inject(ConnectorMessage::new(subject, vec![i as u8]))
            .await
            .unwrap();
    }

    for i in 0..50 {
        let msg = f.collective.next_published(WAIT).await.unwrap();
        assert_eq!(msg.subject, format!("seq.{}", i));
    }

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_side_at_start_then_recovers() {
    let f = fixture("dc1");
    f.federation.set_refuse_connect(true);

    f.broker.start().await.unwrap();

    let stats = f.broker.stats();
    assert_eq!(stats.status, Status::Unknown);
    assert_eq!(
        stats.collective_stats.connected_server,
        "nats://collective.example.net:4222"
    );
    assert_eq!(stats.federation_stats.connected_server, "unknown");

    let manager = f.federation_manager.clone();
    eventually("background connect attempts", move || manager.calls() > 2).await;
    assert_eq!(f.broker.stats().status, Status::Unknown);

    f.federation.set_refuse_connect(false);
    assert!(f.broker.wait_for_status(Status::Running, WAIT).await);
    assert_eq!(
        f.broker.stats().federation_stats.connected_server,
        "nats://federation.example.net:4222"
    );
    assert_eq!(
        f.broker.subscriptions(Side::Federation).await,
        vec!["dc1.federation".to_string()]
    );

    f.federation
        .inject(ConnectorMessage::new(
            "choria.federation.dc1.federation.late.start",
            "x",
        ))
        .await
        .unwrap();
    assert_eq!(
        f.collective.next_published(WAIT).await.unwrap().subject,
        "late.start"
    );

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_connection_loss_degrades_then_recovers() {
    let f = started("dc1").await;

    f.federation.set_refuse_connect(true);
    f.federation.drop_connection();

    assert!(f.broker.wait_for_status(Status::Degraded, WAIT).await);
    let broker = f.broker.clone();
    eventually("federation server reset", move || {
        broker.stats().federation_stats.connected_server == "unknown"
    })
    .await;
    assert_eq!(f.broker.stats().status, Status::Degraded);
    assert!(!f.federation.has_subscription("dc1.federation"));

    f.federation.set_refuse_connect(false);
    assert!(f.broker.wait_for_status(Status::Running, WAIT).await);

    // Subscription rebuilt on the reconnected session
    assert!(f.federation.has_subscription("dc1.federation"));
    let stats = f.broker.stats();
    assert_eq!(stats.federation_stats.reconnects, 1);
    assert_ne!(stats.federation_stats.connected_server, "unknown");

    f.federation
        .inject(ConnectorMessage::new(
            "choria.federation.dc1.federation.after.reconnect",
            "x",
        ))
        .await
        .unwrap();
    assert_eq!(
        f.collective.next_published(WAIT).await.unwrap().subject,
        "after.reconnect"
    );

    let statuses: Vec<_> = f.broker.status_history().iter().map(|t| t.to).collect();
    assert_eq!(
        &statuses[statuses.len() - 2..],
        &[Status::Degraded, Status::Running]
    );

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_session_restored_between_health_polls() {
    let mut config = test_config();
    config.health_interval_ms = 60_000;
    let f = fixture_with("dc1", config);
    f.broker.start().await.unwrap();
    assert!(f.broker.wait_for_status(Status::Running, WAIT).await);

    // The transport drops and restores its session before the next poll
    f.federation.drop_connection();
    assert!(f.broker.wait_for_status(Status::Degraded, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.federation.connect().await.unwrap();

    assert!(f.broker.wait_for_status(Status::Running, WAIT).await);
    assert!(f.federation.has_subscription("dc1.federation"));
    assert_eq!(f.broker.stats().federation_stats.reconnects, 0);

    let delivered = f
        .federation
        .inject(ConnectorMessage::new(
            "choria.federation.dc1.federation.after.failover",
            "x",
        ))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(
        f.collective.next_published(WAIT).await.unwrap().subject,
        "after.failover"
    );

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_rejected_subscription_keeps_broker_degraded() {
    let f = started("dc1").await;

    f.federation.set_reject_subscriptions(true);
    f.federation.drop_connection();
    assert!(f.broker.wait_for_status(Status::Degraded, WAIT).await);

    let broker = f.broker.clone();
    eventually("federation reconnect", move || {
        broker.stats().federation_stats.reconnects >= 1
    })
    .await;

    // Several resubscribe attempts fail in this window
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = f.broker.stats();
    assert_eq!(stats.status, Status::Degraded);
    assert_ne!(stats.federation_stats.connected_server, "unknown");
    assert!(!f.federation.has_subscription("dc1.federation"));
    assert!(f.broker.subscriptions(Side::Federation).await.is_empty());

    f.federation.set_reject_subscriptions(false);
    assert!(f.broker.wait_for_status(Status::Running, WAIT).await);
    assert!(f.federation.has_subscription("dc1.federation"));
    assert_eq!(
        f.broker.subscriptions(Side::Federation).await,
        vec!["dc1.federation".to_string()]
    );

    f.federation
        .inject(ConnectorMessage::new(
            "choria.federation.dc1.federation.resubscribed",
            "x",
        ))
        .await
        .unwrap();
    assert_eq!(
        f.collective.next_published(WAIT).await.unwrap().subject,
        "resubscribed"
    );

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_running_never_reported_with_unknown_server() {
    let f = started("dc1").await;

    let mut readers = Vec::new();
    for _ in 0..4 {
        let broker = f.broker.clone();
        readers.push(tokio::spawn(async move {
            let mut checked = 0;
            for _ in 0..2000 {
                let stats = broker.stats();
                if stats.status == Status::Running {
                    assert_ne!(stats.collective_stats.connected_server, "unknown");
                    assert_ne!(stats.federation_stats.connected_server, "unknown");
                    checked += 1;
                }
                tokio::task::yield_now().await;
            }
            checked
        }));
    }

    for round in 1..=5u64 {
        f.federation.drop_connection();
        let broker = f.broker.clone();
        eventually("reconnect", move || {
            broker.stats().federation_stats.reconnects >= round
        })
        .await;
        assert!(f.broker.wait_for_status(Status::Running, WAIT).await);
    }

    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(f.broker.stats().federation_stats.reconnects, 5);

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_update_routes_reconciles_subscriptions() {
    let f = started("dc1").await;

    let mut routes = default_routes("dc1");
    routes.truncate(1);
    routes.push(Route {
        name: "audit".to_string(),
        source: Side::Collective,
        subject: "audit.>".to_string(),
        group: String::new(),
        target: RouteTarget::Subject {
            subject: "federation.audit".to_string(),
        },
    });

    f.broker.update_routes(routes).await.unwrap();

    assert_eq!(
        f.broker.subscriptions(Side::Collective).await,
        vec!["audit".to_string()]
    );
    assert_eq!(
        f.broker.subscriptions(Side::Federation).await,
        vec!["dc1.federation".to_string()]
    );
    assert!(!f.collective.has_subscription("dc1.collective"));
    assert_eq!(f.broker.stats().status, Status::Running);

    f.collective
        .inject(ConnectorMessage::new("audit.login", "who"))
        .await
        .unwrap();
    let msg = f.federation.next_published(WAIT).await.unwrap();
    assert_eq!(msg.subject, "federation.audit");

    // Removed route no longer relays
    let delivered = f
        .collective
        .inject(ConnectorMessage::new("choria.federation.dc1.collective.x", "y"))
        .await
        .unwrap();
    assert_eq!(delivered, 0);

    f.broker.update_routes(default_routes("dc1")).await.unwrap();
    assert_eq!(
        f.broker.subscriptions(Side::Collective).await,
        vec!["dc1.collective".to_string()]
    );

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_update_routes_replaces_changed_subject() {
    let f = started("dc1").await;

    let mut routes = default_routes("dc1");
    routes[1].subject = "choria.federation.dc1.replies.>".to_string();
    routes[1].target = RouteTarget::StripPrefix {
        prefix: "choria.federation.dc1.replies".to_string(),
    };
    f.broker.update_routes(routes).await.unwrap();

    assert_eq!(
        f.broker.subscriptions(Side::Collective).await,
        vec!["dc1.collective".to_string()]
    );
    assert_eq!(
        f.collective.subscriptions(),
        vec![(
            "dc1.collective".to_string(),
            "choria.federation.dc1.replies.>".to_string(),
            "dc1_collective".to_string()
        )]
    );

    let delivered = f
        .collective
        .inject(ConnectorMessage::new(
            "choria.federation.dc1.collective.old.reply",
            "x",
        ))
        .await
        .unwrap();
    assert_eq!(delivered, 0);

    let delivered = f
        .collective
        .inject(ConnectorMessage::new(
            "choria.federation.dc1.replies.new.reply",
            "y",
        ))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let msg = f.federation.next_published(WAIT).await.unwrap();
    assert_eq!(msg.subject, "new.reply");
    assert_eq!(msg.data, b"y".to_vec());
    assert_eq!(f.broker.stats().status, Status::Running);

    f.broker.shutdown().await;
}

#[tokio::test]
async fn test_back_pressure_reaches_the_transport() {
    let mut config = test_config();
    config.channel_capacity = 2;
    config.publish_timeout_ms = 60_000;

    let f = fixture_with("dc1", config);
    f.broker.start().await.unwrap();
    assert!(f.broker.wait_for_status(Status::Running, WAIT).await);

    f.collective.set_stall_publish(true);
    let msg = |i: u8| ConnectorMessage::new("choria.federation.dc1.federation.bp", vec![i]);

    // The relay takes the first message and blocks publishing it
    f.federation.try_inject(msg(0)).unwrap();
    let broker = f.broker.clone();
    eventually("relay picked up first message", move || {
        broker.stats().federation_stats.received == 1
    })
    .await;

    f.federation.try_inject(msg(1)).unwrap();
    f.federation.try_inject(msg(2)).unwrap();
    assert!(matches!(
        f.federation.try_inject(msg(3)),
        Err(ConnectorError::ChannelFull(_))
    ));

    tokio::time::timeout(Duration::from_secs(2), f.broker.shutdown())
        .await
        .expect("shutdown must not wait for a stalled publish");
    assert_eq!(f.collective.published_count(), 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let f = started("dc1").await;

    f.broker.shutdown().await;
    f.broker.shutdown().await;

    let stats = f.broker.stats();
    assert_eq!(stats.status, Status::Stopped);
    assert_eq!(stats.collective_stats.connected_server, "unknown");
    assert_eq!(stats.federation_stats.subscriptions, 0);

    assert!(f.collective.subscriptions().is_empty());
    assert!(f.federation.subscriptions().is_empty());
    assert!(!f.federation.is_connected());
    assert!(f.broker.subscriptions(Side::Federation).await.is_empty());

    // Closed connectors accept no more traffic
    assert!(matches!(
        f.federation
            .inject(ConnectorMessage::new("choria.federation.dc1.federation.x", "y"))
            .await,
        Err(ConnectorError::Closed)
    ));

    let last = f.broker.status_history().last().cloned().unwrap();
    assert_eq!(last.from, Status::Running);
    assert_eq!(last.to, Status::Stopped);
}

#[tokio::test]
async fn test_shutdown_while_side_unreachable() {
    let f = fixture("dc1");
    f.federation.set_refuse_connect(true);
    f.broker.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), f.broker.shutdown())
        .await
        .unwrap();
    assert_eq!(f.broker.stats().status, Status::Stopped);
}

#[tokio::test]
async fn test_shutdown_while_supervisor_is_busy() {
    let f = started("dc1").await;

    // Every resubscribe after the session loss takes a while
    f.federation.set_subscribe_delay(Some(Duration::from_millis(500)));
    f.federation.drop_connection();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let broker = f.broker.clone();
    let query = tokio::spawn(async move { broker.subscriptions(Side::Federation).await });
    let broker = f.broker.clone();
    let update = tokio::spawn(async move { broker.update_routes(default_routes("dc1")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), f.broker.shutdown())
        .await
        .expect("shutdown must not wait on pending callers");

    // Callers are either answered or told the broker is gone
    tokio::time::timeout(Duration::from_secs(5), query)
        .await
        .expect("subscriptions query left waiting")
        .unwrap();
    let updated = tokio::time::timeout(Duration::from_secs(5), update)
        .await
        .expect("route update left waiting")
        .unwrap();
    if let Err(e) = updated {
        assert!(e.is_fatal());
    }

    assert_eq!(f.broker.stats().status, Status::Stopped);
    assert!(!f.federation.is_connected());
}
