//! Subnet conflict scenarios: primary election, single interface
//! configuration per subnet, and secondary routability.

use std::time::Duration;

use tunnel_router::endpoint::TunnelAssignment;
use tunnel_router::router::RouteOutcome;
use tunnel_router::rules::RoutingRule;
use tunnel_router::subnet::SubnetRole;

use super::harness::{test_config, udp_packet, wait_for, ScriptedBackend, ScriptedFactory, TestStack};

fn assignment(addr: &str, prefix: u8, dns: &[&str]) -> TunnelAssignment {
    TunnelAssignment {
        address: addr.parse().unwrap(),
        prefix,
        dns_servers: dns.iter().map(|d| d.parse().unwrap()).collect(),
    }
}

#[tokio::test]
async fn test_shared_subnet_one_primary_one_interface_action() {
    let west = ScriptedBackend::new();
    west.set_report(assignment("10.50.0.2", 16, &["10.50.0.1"]));
    let east = ScriptedBackend::new();
    east.set_report(assignment("10.50.1.7", 16, &["10.50.1.1"]));

    let factory = ScriptedFactory::new();
    factory.register("west", west.clone());
    factory.register("east", east.clone());

    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.game"), (5000, "com.example.stream")],
        &[
            RoutingRule::tunnel("com.example.game", "west"),
            RoutingRule::tunnel("com.example.stream", "east"),
        ],
        factory,
    );

    // West comes up first and claims the subnet
    stack
        .router
        .route_outbound(udp_packet(4000, 443, b"west-p1"))
        .await;
    let registry = stack.registry.clone();
    assert!(wait_for(|| registry.contains("west"), Duration::from_secs(2)).await);
    let iface = stack.iface.clone();
    assert!(wait_for(|| !iface.configures.lock().is_empty(), Duration::from_secs(2)).await);

    // East reports the same subnet and joins as secondary
    let east_p1 = udp_packet(5000, 443, b"east-p1");
    stack.router.route_outbound(east_p1.clone()).await;
    assert!(wait_for(|| registry.contains("east"), Duration::from_secs(2)).await);
    let allocator = stack.allocator.clone();
    assert!(
        wait_for(
            || allocator.role_of("east") == Some(SubnetRole::Secondary),
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(stack.allocator.role_of("west"), Some(SubnetRole::Primary));

    // Exactly one interface configuration for the shared subnet, and it
    // carries the primary's address and DNS
    let configures = stack.iface.configures.lock().clone();
    assert_eq!(configures.len(), 1, "one action per subnet, not per tunnel");
    assert_eq!(
        configures[0].addresses,
        vec![("10.50.0.2".parse().unwrap(), 16)]
    );
    assert_eq!(
        configures[0].dns_servers,
        vec!["10.50.0.1".parse::<std::net::IpAddr>().unwrap()]
    );

    // East traffic still routes despite having no interface address
    assert!(
        wait_for(|| east.sent_payloads().len() == 1, Duration::from_secs(2)).await,
        "secondary tunnel carries its traffic"
    );
    assert_eq!(east.sent_payloads()[0], east_p1.to_vec());

    let east_p2 = udp_packet(5000, 443, b"east-p2");
    assert_eq!(
        stack.router.route_outbound(east_p2.clone()).await,
        RouteOutcome::Tunneled("east".into())
    );
    assert_eq!(east.sent_payloads()[1], east_p2.to_vec());
}

#[tokio::test]
async fn test_distinct_subnets_each_get_an_interface_address() {
    let west = ScriptedBackend::new();
    west.set_report(assignment("10.50.0.2", 16, &[]));
    let east = ScriptedBackend::new();
    east.set_report(assignment("10.60.0.2", 16, &[]));

    let factory = ScriptedFactory::new();
    factory.register("west", west.clone());
    factory.register("east", east.clone());

    let stack = TestStack::build(
        test_config(),
        &[(4000, "com.example.game"), (5000, "com.example.stream")],
        &[
            RoutingRule::tunnel("com.example.game", "west"),
            RoutingRule::tunnel("com.example.stream", "east"),
        ],
        factory,
    );

    stack
        .router
        .route_outbound(udp_packet(4000, 443, b"w"))
        .await;
    stack
        .router
        .route_outbound(udp_packet(5000, 443, b"e"))
        .await;

    let allocator = stack.allocator.clone();
    assert!(
        wait_for(|| allocator.subnet_count() == 2, Duration::from_secs(2)).await,
        "both subnets tracked"
    );
    assert_eq!(stack.allocator.role_of("west"), Some(SubnetRole::Primary));
    assert_eq!(stack.allocator.role_of("east"), Some(SubnetRole::Primary));

    // A configuration exposing one address per subnet was applied
    let iface = stack.iface.clone();
    assert!(
        wait_for(
            || iface
                .configures
                .lock()
                .iter()
                .any(|u| u.addresses.len() == 2),
            Duration::from_secs(2)
        )
        .await
    );
}
