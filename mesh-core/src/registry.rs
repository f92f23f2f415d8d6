//! Entity registry (C3), spec §9 "Global mutable state": a single `World`
//! context owning every node, edge, subnet, and connection, indexed for
//! lookup by name, by `(owner, net)`, and by UDP address — passed to every
//! handler instead of process-wide globals. Grounded on the teacher's
//! `Node` (`zerotier-network-hypervisor/src/vl1/node.rs`), which plays the
//! same "one context, several `DashMap` indexes" role for paths/peers/roots.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::model::edge::Edge;
use crate::model::node::Node;
use crate::model::subnet::{Subnet, SubnetKey};
use crate::model::connection::Connection;
use crate::store::OrderedStore;

/// Dedup entry for the flood-suppression cache (spec §3 "Past-request
/// cache", §4.2 "Flood and dedup", §8 properties 2 and 8).
struct PastRequest {
    first_seen: i64,
}

/// The single context every C5/C6/C7 handler operates on. Not `Send`/`Sync`
/// by design: spec §5 mandates all mutation happens on the reactor thread,
/// so there is deliberately no internal locking here — that's what keeps
/// `graph()`/`route()` simple to reason about and to unit test.
pub struct Registry {
    pub self_name: String,
    nodes: HashMap<String, Node>,
    edges_by_weight: OrderedStore<(u32, String, String), ()>,
    edges: HashMap<(String, String), Edge>,
    subnets: HashMap<SubnetKey, Subnet>,
    subnets_by_owner: HashMap<String, HashSet<SubnetKey>>,
    connections: HashMap<u64, Connection>,
    udp_index: HashMap<SocketAddr, String>,
    past_requests: HashMap<String, PastRequest>,
    next_connection_id: u64,
}

impl Registry {
    pub fn new(self_name: impl Into<String>) -> Self {
        let self_name = self_name.into();
        let mut reg = Self {
            self_name: self_name.clone(),
            nodes: HashMap::new(),
            edges_by_weight: OrderedStore::new(),
            edges: HashMap::new(),
            subnets: HashMap::new(),
            subnets_by_owner: HashMap::new(),
            connections: HashMap::new(),
            udp_index: HashMap::new(),
            past_requests: HashMap::new(),
            next_connection_id: 1,
        };
        reg.nodes.insert(self_name.clone(), Node::new(self_name));
        reg
    }

    // ---- nodes ----

    /// Returns the existing node or creates one (spec §3 "Lifecycles":
    /// "created on first reference").
    pub fn node_or_create(&mut self, name: &str) -> &mut Node {
        self.nodes.entry(name.to_string()).or_insert_with(|| Node::new(name))
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn self_node(&self) -> &Node {
        self.nodes.get(&self.self_name).expect("self node always present")
    }

    // ---- UDP address index ----

    pub fn index_udp_address(&mut self, addr: SocketAddr, name: &str) {
        self.udp_index.insert(addr, name.to_string());
    }

    pub fn remove_udp_address(&mut self, addr: &SocketAddr) {
        self.udp_index.remove(addr);
    }

    pub fn node_by_udp_address(&self, addr: &SocketAddr) -> Option<&str> {
        self.udp_index.get(addr).map(|s| s.as_str())
    }

    // ---- edges ----

    /// Add or replace the edge `from -> to`. Also updates the weight-sorted
    /// index the graph engine (C6) walks for Kruskal.
    pub fn add_edge(&mut self, edge: Edge) {
        let key = (edge.from.clone(), edge.to.clone());
        if let Some(old) = self.edges.get(&key) {
            self.edges_by_weight.remove(&old.sort_key());
        }
        self.edges_by_weight.insert(edge.sort_key(), ());
        self.nodes.entry(edge.from.clone()).or_insert_with(|| Node::new(edge.from.clone()));
        self.nodes.entry(edge.to.clone()).or_insert_with(|| Node::new(edge.to.clone()));
        if let Some(n) = self.nodes.get_mut(&edge.from) {
            n.known_edges.insert(edge.to.clone());
        }
        self.edges.insert(key, edge);
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) -> Option<Edge> {
        let removed = self.edges.remove(&(from.to_string(), to.to_string()))?;
        self.edges_by_weight.remove(&removed.sort_key());
        if let Some(n) = self.nodes.get_mut(from) {
            n.known_edges.remove(to);
        }
        Some(removed)
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&Edge> {
        self.edges.get(&(from.to_string(), to.to_string()))
    }

    /// Does `from -> to` have a reverse `to -> from`? Spec §9: "Treat
    /// `reverse` as a derived lookup, not ownership."
    pub fn has_reverse(&self, from: &str, to: &str) -> bool {
        self.edges.contains_key(&(to.to_string(), from.to_string()))
    }

    /// Edges in ascending weight order, ties broken by `(from, to)` — the
    /// exact iteration order Kruskal (C6) needs.
    pub fn edges_weight_sorted(&self) -> impl Iterator<Item = &Edge> {
        self.edges_by_weight.keys().map(move |(_, from, to)| self.edges.get(&(from.clone(), to.clone())).expect("weight index out of sync"))
    }

    pub fn edges_from(&self, from: &str) -> impl Iterator<Item = &Edge> {
        let from = from.to_string();
        self.edges.values().filter(move |e| e.from == from)
    }

    pub fn all_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn edge_mut(&mut self, from: &str, to: &str) -> Option<&mut Edge> {
        self.edges.get_mut(&(from.to_string(), to.to_string()))
    }

    // ---- subnets ----

    /// Spec §3 invariant: "A Subnet appears in at most one (owner) node's
    /// subnet set at a time." Re-advertising the same key replaces the
    /// previous owner's copy rather than duplicating it.
    pub fn add_subnet(&mut self, subnet: Subnet) {
        let key = subnet.key;
        if let Some(old) = self.subnets.get(&key) {
            if let Some(set) = self.subnets_by_owner.get_mut(&old.owner) {
                set.remove(&key);
            }
            if let Some(n) = self.nodes.get_mut(&old.owner) {
                n.owned_subnets.remove(&key);
            }
        }
        self.subnets_by_owner.entry(subnet.owner.clone()).or_default().insert(key);
        if let Some(n) = self.nodes.get_mut(&subnet.owner) {
            n.owned_subnets.insert(key);
        }
        self.subnets.insert(key, subnet);
    }

    pub fn remove_subnet(&mut self, key: &SubnetKey) -> Option<Subnet> {
        let removed = self.subnets.remove(key)?;
        if let Some(set) = self.subnets_by_owner.get_mut(&removed.owner) {
            set.remove(key);
        }
        if let Some(n) = self.nodes.get_mut(&removed.owner) {
            n.owned_subnets.remove(key);
        }
        Some(removed)
    }

    pub fn subnet(&self, key: &SubnetKey) -> Option<&Subnet> {
        self.subnets.get(key)
    }

    pub fn subnets_owned_by(&self, owner: &str) -> impl Iterator<Item = &Subnet> {
        let keys: Vec<SubnetKey> = self.subnets_by_owner.get(owner).map(|s| s.iter().copied().collect()).unwrap_or_default();
        keys.into_iter().filter_map(move |k| self.subnets.get(&k))
    }

    pub fn all_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.values()
    }

    /// Spec §4.6 periodic maintenance: sweep every subnet past its `expires`
    /// timestamp and drop it, mirroring `RoutingEngine::expire_macs`'s
    /// reaper for the MAC-learning table.
    pub fn expire_subnets(&mut self, now: i64) -> Vec<Subnet> {
        let expired: Vec<SubnetKey> = self.subnets.values().filter(|s| s.is_expired(now)).map(|s| s.key).collect();
        expired.into_iter().filter_map(|k| self.remove_subnet(&k)).collect()
    }

    /// Longest-prefix match over all known subnets (spec §4.4 "router"
    /// mode). Linear scan is fine at mesh scale (tens to low hundreds of
    /// subnets); a trie is the textbook upgrade if that stops being true.
    pub fn find_owner_of_ipv4(&self, ip: std::net::Ipv4Addr) -> Option<&Subnet> {
        self.subnets
            .values()
            .filter(|s| s.key.contains_ipv4(ip))
            .max_by_key(|s| (s.key.prefix_len(), std::cmp::Reverse(s.weight)))
    }

    pub fn find_owner_of_ipv6(&self, ip: std::net::Ipv6Addr) -> Option<&Subnet> {
        self.subnets
            .values()
            .filter(|s| s.key.contains_ipv6(ip))
            .max_by_key(|s| (s.key.prefix_len(), std::cmp::Reverse(s.weight)))
    }

    pub fn find_owner_of_mac(&self, mac: crate::model::subnet::MacAddr) -> Option<&Subnet> {
        self.subnets.get(&SubnetKey::Mac(mac))
    }

    // ---- connections ----

    pub fn allocate_connection_id(&mut self) -> u64 {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        id
    }

    pub fn insert_connection(&mut self, conn: Connection) -> u64 {
        let id = conn.id;
        self.connections.insert(id, conn);
        id
    }

    pub fn connection(&self, id: u64) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn remove_connection(&mut self, id: u64) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn active_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(|c| c.flags.active)
    }

    pub fn connection_for_peer(&self, name: &str) -> Option<&Connection> {
        self.connections.values().find(|c| c.peer_name.as_deref() == Some(name) && c.flags.active)
    }

    // ---- past-request dedup cache ----

    /// Spec §8 property 1/2: applying an identical request twice is a
    /// no-op. Returns `true` the first time a given request string is seen.
    pub fn seen_request(&mut self, request: &str, now: i64) -> bool {
        if self.past_requests.contains_key(request) {
            false
        } else {
            self.past_requests.insert(request.to_string(), PastRequest { first_seen: now });
            true
        }
    }

    /// Spec §8 property 8 / SPEC_FULL "past_request TTL reaping": purge
    /// entries older than `pingtimeout`, run on the same tick as PING.
    pub fn age_past_requests(&mut self, now: i64, pingtimeout: i64) {
        self.past_requests.retain(|_, v| v.first_seen + pingtimeout >= now);
    }

    pub fn past_request_count(&self) -> usize {
        self.past_requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_node_exists_on_construction() {
        let reg = Registry::new("self");
        assert!(reg.node("self").is_some());
    }

    #[test]
    fn seen_request_is_idempotent_until_aged_out() {
        let mut reg = Registry::new("self");
        assert!(reg.seen_request("ADD_EDGE a b 1 tok", 0));
        assert!(!reg.seen_request("ADD_EDGE a b 1 tok", 1));
        reg.age_past_requests(100, 5);
        assert!(reg.seen_request("ADD_EDGE a b 1 tok", 100));
    }

    #[test]
    fn subnet_ownership_is_exclusive() {
        let mut reg = Registry::new("self");
        let key: SubnetKey = "10.0.0.0/24".parse().unwrap();
        reg.add_subnet(Subnet::new(key, "a"));
        reg.add_subnet(Subnet::new(key, "b"));
        assert_eq!(reg.subnet(&key).unwrap().owner, "b");
        assert!(reg.subnets_owned_by("a").next().is_none());
        assert_eq!(reg.subnets_owned_by("b").count(), 1);
    }

    #[test]
    fn edges_weight_sorted_breaks_ties_on_names() {
        let mut reg = Registry::new("self");
        reg.add_edge(Edge::new("b", "z", 5));
        reg.add_edge(Edge::new("a", "y", 5));
        reg.add_edge(Edge::new("a", "c", 1));
        let order: Vec<(String, String)> = reg.edges_weight_sorted().map(|e| (e.from.clone(), e.to.clone())).collect();
        assert_eq!(order, vec![("a".into(), "c".into()), ("a".into(), "y".into()), ("b".into(), "z".into())]);
    }
}
