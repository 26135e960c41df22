//! Core routing behavior: rule dispatch, policy, classification
//! stability, and the serialized inbound write path.

use std::time::Duration;

use bytes::Bytes;
use tunnel_router::router::{DropReason, RouteOutcome};
use tunnel_router::rules::RoutingRule;

use super::harness::{test_config, udp_packet, wait_for, ScriptedBackend, ScriptedFactory, TestStack};

#[tokio::test]
async fn test_direct_rule_routes_outside_tunnels() {
    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.browser")],
        &[RoutingRule::direct("com.example.browser")],
        ScriptedFactory::new(),
    );

    let packet = udp_packet(4000, 443, b"p1");
    let outcome = stack.router.route_outbound(packet.clone()).await;

    assert_eq!(outcome, RouteOutcome::Direct);
    assert_eq!(stack.direct.sent.lock().as_slice(), &[packet]);
    assert_eq!(stack.router.stats().direct, 1);
}

#[tokio::test]
async fn test_unmatched_app_follows_policy() {
    // Default policy: unmatched goes direct
    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.unknown")],
        &[],
        ScriptedFactory::new(),
    );
    let outcome = stack.router.route_outbound(udp_packet(4000, 443, b"p")).await;
    assert_eq!(outcome, RouteOutcome::Direct);

    // Restrictive policy: unmatched is dropped
    let mut config = test_config();
    config.policy.unmatched_direct = false;
    let stack = TestStack::build(
        config,
        &[(4000, "com.example.unknown")],
        &[],
        ScriptedFactory::new(),
    );
    let outcome = stack.router.route_outbound(udp_packet(4000, 443, b"p")).await;
    assert_eq!(outcome, RouteOutcome::Dropped(DropReason::NoRuleMatch));
    assert!(stack.direct.sent.lock().is_empty());
}

#[tokio::test]
async fn test_unresolvable_flow_is_dropped_not_routed_blind() {
    // Port 9999 is unknown to the resolver
    let stack = TestStack::build(test_config(), &[], &[], ScriptedFactory::new());

    let outcome = stack.router.route_outbound(udp_packet(9999, 443, b"p")).await;
    assert_eq!(
        outcome,
        RouteOutcome::Dropped(DropReason::ClassificationUnavailable)
    );
    assert!(stack.direct.sent.lock().is_empty());
    assert!(stack.tracker.is_empty());
}

#[tokio::test]
async fn test_non_flow_packet_passes_through_direct() {
    let stack = TestStack::build(test_config(), &[], &[], ScriptedFactory::new());

    // ICMP echo: protocol 1, no ports
    let mut icmp = vec![
        0x45, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 1, 0x00, 0x00, 0x0a, 0x00, 0x00,
        0x02, 0x01, 0x01, 0x01, 0x01,
    ];
    icmp.extend_from_slice(&[8, 0, 0, 0]);

    let outcome = stack.router.route_outbound(Bytes::from(icmp)).await;
    assert_eq!(outcome, RouteOutcome::Direct);
}

#[tokio::test]
async fn test_classification_stable_across_rule_change() {
    let west = ScriptedBackend::new();
    let east = ScriptedBackend::new();
    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.game"), (4001, "com.example.game")],
        &[RoutingRule::tunnel("com.example.game", "west")],
        ScriptedFactory::new(),
    );
    stack.install_tunnel("west", west.clone()).await;
    stack.install_tunnel("east", east.clone()).await;

    // First flow binds to west under the old snapshot
    let p1 = udp_packet(4000, 443, b"p1");
    assert_eq!(
        stack.router.route_outbound(p1.clone()).await,
        RouteOutcome::Tunneled("west".into())
    );

    // Rules move the app to east
    stack.apply_rules(&[RoutingRule::tunnel("com.example.game", "east")], 2);

    // The existing flow stays on west; a new flow goes east
    let p2 = udp_packet(4000, 443, b"p2");
    assert_eq!(
        stack.router.route_outbound(p2.clone()).await,
        RouteOutcome::Tunneled("west".into())
    );
    let p3 = udp_packet(4001, 443, b"p3");
    assert_eq!(
        stack.router.route_outbound(p3.clone()).await,
        RouteOutcome::Tunneled("east".into())
    );

    assert_eq!(west.sent_payloads(), vec![p1.to_vec(), p2.to_vec()]);
    assert_eq!(east.sent_payloads(), vec![p3.to_vec()]);
}

#[tokio::test]
async fn test_buffer_contract_on_router_send_path() {
    let west = ScriptedBackend::new();
    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.game")],
        &[RoutingRule::tunnel("com.example.game", "west")],
        ScriptedFactory::new(),
    );
    stack.install_tunnel("west", west.clone()).await;

    stack
        .router
        .route_outbound(udp_packet(4000, 443, &vec![0xEE; 1000]))
        .await;

    let layouts = west.layouts.lock();
    assert_eq!(layouts.len(), 1);
    let (headroom, tailroom) = layouts[0];
    assert!(headroom >= 256, "headroom {headroom}");
    assert!(tailroom >= 128, "tailroom {tailroom}");
}

#[tokio::test]
async fn test_inbound_packets_reach_interface_via_single_writer() {
    let west = ScriptedBackend::new();
    let east = ScriptedBackend::new();
    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.game")],
        &[RoutingRule::tunnel("com.example.game", "west")],
        ScriptedFactory::new(),
    );
    stack.install_tunnel("west", west.clone()).await;
    stack.install_tunnel("east", east.clone()).await;

    west.inject_inbound(Bytes::from_static(b"from-west")).await;
    east.inject_inbound(Bytes::from_static(b"from-east")).await;

    let iface = stack.iface.clone();
    assert!(
        wait_for(|| iface.written.lock().len() == 2, Duration::from_secs(2)).await,
        "both inbound packets written"
    );

    let written = iface.written.lock();
    assert!(written.iter().any(|p| p.as_ref() == b"from-west"));
    assert!(written.iter().any(|p| p.as_ref() == b"from-east"));
}
