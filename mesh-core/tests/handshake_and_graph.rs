//! End-to-end exercises over in-memory `Registry` instances, no sockets
//! (SPEC_FULL.md "Test tooling": a few `tests/` integration tests covering
//! spec §8 properties end-to-end).

use mesh_core::model::connection::{AllowRequest, Connection};
use mesh_core::protocol::{handle_line, Effect, ProtocolConfig, Verb};
use mesh_core::registry::Registry;

fn connect(registry: &mut Registry, peer_addr: &str) -> u64 {
    let id = registry.allocate_connection_id();
    registry.insert_connection(Connection::new(id, peer_addr.parse().unwrap(), false, 64 * 1024));
    id
}

/// Fast-forward a connection straight to the post-handshake `All` permit,
/// for tests that only care about post-handshake verb behavior.
fn connect_active(registry: &mut Registry, peer_addr: &str) -> u64 {
    let id = connect(registry, peer_addr);
    let conn = registry.connection_mut(id).unwrap();
    conn.allow_request = AllowRequest::All;
    conn.flags.active = true;
    id
}

#[test]
fn full_handshake_converges_both_sides_on_the_same_edge() {
    let mut alice = Registry::new("alice");
    let config = ProtocolConfig::default();
    let conn = connect(&mut alice, "127.0.0.1:1");

    let id_line = format!("{} bob {}.{}", Verb::Id as u8, config.protocol_major, config.protocol_minor);
    let effects = handle_line(&mut alice, conn, &id_line, 0, &config).unwrap();
    assert!(matches!(&effects[0], Effect::Send { line, .. } if line.starts_with("0 alice")));

    let metakey_line = format!("{} deadbeef", Verb::MetaKey as u8);
    handle_line(&mut alice, conn, &metakey_line, 0, &config).unwrap();

    let challenge_line = format!("{} cafebabe", Verb::Challenge as u8);
    let effects = handle_line(&mut alice, conn, &challenge_line, 0, &config).unwrap();
    let digest = match &effects[0] {
        Effect::Send { line, .. } => line.clone(),
        _ => panic!("expected CHAL_REPLY send"),
    };
    assert!(digest.starts_with(&format!("{} ", Verb::ChalReply as u8)));

    handle_line(&mut alice, conn, &format!("{} ignored-digest", Verb::ChalReply as u8), 0, &config).unwrap();

    let effects = handle_line(&mut alice, conn, &format!("{} 0", Verb::Ack as u8), 0, &config).unwrap();
    assert!(effects.iter().any(|e| matches!(e, Effect::Broadcast { line, .. } if line.contains("bob"))));

    assert!(alice.node("bob").unwrap().has_connection.load(std::sync::atomic::Ordering::Relaxed));
    assert!(alice.edge("alice", "bob").is_some());
}

#[test]
fn reachability_propagates_through_an_intermediate_hop() {
    use mesh_core::graph::compute_graph;
    use mesh_core::model::edge::Edge;

    let mut reg = Registry::new("a");
    reg.node_or_create("b");
    reg.node_or_create("c");
    reg.add_edge(Edge::new("a", "b", 1));
    reg.add_edge(Edge::new("b", "a", 1));
    reg.add_edge(Edge::new("b", "c", 1));
    reg.add_edge(Edge::new("c", "b", 1));

    let changes = compute_graph(&mut reg);
    assert!(changes.iter().any(|c| c.node == "b" && c.became_reachable));
    assert!(changes.iter().any(|c| c.node == "c" && c.became_reachable));
    assert_eq!(reg.node("c").unwrap().nexthop, "b");

    // Drop the bridge: c should become unreachable again.
    reg.remove_edge("b", "c");
    reg.remove_edge("c", "b");
    let changes = compute_graph(&mut reg);
    assert!(changes.iter().any(|c| c.node == "c" && !c.became_reachable));
}

#[test]
fn duplicate_flood_is_a_strict_no_op() {
    let mut reg = Registry::new("self");
    let config = ProtocolConfig::default();
    let conn_a = connect_active(&mut reg, "127.0.0.1:1");
    let conn_b = connect_active(&mut reg, "127.0.0.1:2");

    let line = format!("{} a 10.0.0.0/24", Verb::AddSubnet as u8);
    let first = handle_line(&mut reg, conn_a, &line, 0, &config).unwrap();
    assert!(!first.is_empty());

    let second = handle_line(&mut reg, conn_b, &line, 0, &config).unwrap();
    assert!(second.is_empty(), "a second delivery of an identical request must not re-flood");
}
