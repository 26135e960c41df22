//! Reconnection scenarios: a degraded tunnel recovers without losing its
//! identity, and traffic buffered during the outage flushes afterwards.

use std::time::Duration;

use tunnel_router::endpoint::EndpointState;
use tunnel_router::router::RouteOutcome;
use tunnel_router::rules::RoutingRule;

use super::harness::{test_config, udp_packet, wait_for, ScriptedBackend, ScriptedFactory, TestStack};

#[tokio::test]
async fn test_reconnect_preserves_flow_bindings() {
    let west = ScriptedBackend::new();
    let factory = ScriptedFactory::new();
    factory.register("west", west.clone());

    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.game")],
        &[RoutingRule::tunnel("com.example.game", "west")],
        factory,
    );

    // Establish via JIT and bind the flow
    let p1 = udp_packet(4000, 443, b"p1");
    stack.router.route_outbound(p1.clone()).await;
    let registry = stack.registry.clone();
    assert!(wait_for(|| registry.contains("west"), Duration::from_secs(2)).await);
    assert!(wait_for(|| west.sent_payloads().len() == 1, Duration::from_secs(2)).await);

    let endpoint = stack.registry.get("west").unwrap();

    // Transport drops; the endpoint degrades and reconnects with backoff
    west.drop_transport();
    let ep = endpoint.clone();
    assert!(
        wait_for(
            || ep.state() == EndpointState::Active && ep.stats().reconnects == 1,
            Duration::from_secs(5)
        )
        .await,
        "endpoint reconnected"
    );
    assert!(west.connect_count() >= 2);

    // Same registry entry, same tag: the record identity survived
    assert!(stack.registry.contains("west"));

    // The flow routes through the same tunnel without re-classification
    let p2 = udp_packet(4000, 443, b"p2");
    assert_eq!(
        stack.router.route_outbound(p2.clone()).await,
        RouteOutcome::Tunneled("west".into())
    );
    assert_eq!(west.sent_payloads(), vec![p1.to_vec(), p2.to_vec()]);
}

#[tokio::test]
async fn test_packets_buffered_while_degraded_flush_on_recovery() {
    let west = ScriptedBackend::new();
    let factory = ScriptedFactory::new();
    factory.register("west", west.clone());

    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.game")],
        &[RoutingRule::tunnel("com.example.game", "west")],
        factory,
    );

    let p1 = udp_packet(4000, 443, b"p1");
    stack.router.route_outbound(p1.clone()).await;
    let registry = stack.registry.clone();
    assert!(wait_for(|| registry.contains("west"), Duration::from_secs(2)).await);
    assert!(wait_for(|| west.sent_payloads().len() == 1, Duration::from_secs(2)).await);

    let endpoint = stack.registry.get("west").unwrap();
    west.drop_transport();
    let ep = endpoint.clone();
    assert!(
        wait_for(|| ep.state() == EndpointState::Degraded, Duration::from_secs(2)).await,
        "endpoint noticed the drop"
    );

    // Traffic during the outage is buffered, not dropped
    let p2 = udp_packet(4000, 443, b"p2");
    assert_eq!(
        stack.router.route_outbound(p2.clone()).await,
        RouteOutcome::Buffered("west".into())
    );

    // Recovery flushes the buffered packet through the same tunnel
    assert!(
        wait_for(|| west.sent_payloads().len() == 2, Duration::from_secs(5)).await,
        "buffered packet flushed after reconnect"
    );
    assert_eq!(west.sent_payloads()[1], p2.to_vec());
}
