//! Meta protocol (C5), spec §4.2. The 18-verb request language, the
//! handshake permit state machine, flood/dedup, authority rules, and key
//! distribution. Grounded on `original_source/src/protocol.c` (the verb
//! table, `check_id`, flood dedup via `past_request_tree`) and
//! `protocol_subnet.c` (authority retaliation for self-owned subnets).
//!
//! Handlers are pure functions over `Registry` plus one `Connection`: they
//! return the `Effect`s the caller (C9/C10) must perform — sending a reply,
//! flooding to other connections, running a script — rather than doing I/O
//! themselves, which is what makes this module testable without sockets.

use mesh_crypto::{CipherKind, DigestKind, RsaIdentity, SessionCipher, SessionMac};

use crate::error::{Error, Result};
use crate::model::connection::AllowRequest;
use crate::model::edge::Edge;
use crate::model::subnet::Subnet;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    Id = 0,
    MetaKey = 1,
    Challenge = 2,
    ChalReply = 3,
    Ack = 4,
    Status = 5,
    Error = 6,
    TermReq = 7,
    Ping = 8,
    Pong = 9,
    AddSubnet = 10,
    DelSubnet = 11,
    AddEdge = 12,
    DelEdge = 13,
    KeyChanged = 14,
    ReqKey = 15,
    AnsKey = 16,
    Packet = 17,
}

impl Verb {
    pub fn from_id(id: u8) -> Option<Self> {
        use Verb::*;
        Some(match id {
            0 => Id,
            1 => MetaKey,
            2 => Challenge,
            3 => ChalReply,
            4 => Ack,
            5 => Status,
            6 => Error,
            7 => TermReq,
            8 => Ping,
            9 => Pong,
            10 => AddSubnet,
            11 => DelSubnet,
            12 => AddEdge,
            13 => DelEdge,
            14 => KeyChanged,
            15 => ReqKey,
            16 => AnsKey,
            17 => Packet,
            _ => return None,
        })
    }

    /// Verbs that mutate topology/subnet state and are flooded to every
    /// other active connection once accepted (spec §4.2 "Flood and dedup").
    pub fn is_flooded(&self) -> bool {
        matches!(self, Verb::AddSubnet | Verb::DelSubnet | Verb::AddEdge | Verb::DelEdge | Verb::KeyChanged | Verb::ReqKey)
    }
}

/// A side effect a handler wants performed. The reactor/connmgr executes
/// these against real sockets and the script runner.
#[derive(Debug, Clone)]
pub enum Effect {
    Send { connection: u64, line: String },
    Broadcast { exclude: u64, line: String },
    Terminate { connection: u64, reason: String },
    RunScript { name: String, env: Vec<(String, String)> },
}

/// Names must be alphanumeric/underscore, <= 64 chars (spec §3 "Node").
/// Ports `protocol.c::check_id`.
pub fn check_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub struct ProtocolConfig {
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub edge_weight: u32,
    pub tunnel_server: bool,
    pub experimental_protocol: bool,
    pub cipher: CipherKind,
    pub digest: DigestKind,
    pub mac_length: usize,
    /// `MaxOutputBufferSize`, spec §6: per-connection outbound queue cap
    /// before a `Connection::queue_send` call starts rejecting writes.
    pub max_output_buffer_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol_major: 17,
            protocol_minor: 7,
            edge_weight: 1,
            tunnel_server: false,
            experimental_protocol: false,
            cipher: CipherKind::Blowfish,
            digest: DigestKind::Sha1,
            mac_length: 4,
            max_output_buffer_size: 1024 * 1024,
        }
    }
}

/// Dispatch one request line. `conn_id` identifies the `Connection` in
/// `registry` it arrived on. Returns the effects to perform, or a protocol
/// error (spec §4.2 "Any out-of-permit verb => fatal").
pub fn handle_line(registry: &mut Registry, conn_id: u64, line: &str, now: i64, config: &ProtocolConfig, identity: &RsaIdentity) -> Result<Vec<Effect>> {
    let mut parts = line.split_whitespace();
    let verb_id: u8 = parts.next().ok_or_else(|| Error::Protocol("empty request line".into()))?.parse().map_err(|_| Error::Protocol("non-numeric verb id".into()))?;
    let verb = Verb::from_id(verb_id).ok_or_else(|| Error::Protocol(format!("unknown verb id {}", verb_id)))?;
    let args: Vec<&str> = parts.collect();

    let permit = registry.connection(conn_id).ok_or_else(|| Error::Protocol("unknown connection".into()))?.allow_request;
    if !permit_allows(permit, verb) {
        return Err(Error::Protocol(format!("verb {:?} not allowed in permit state {:?}", verb, permit)));
    }

    match verb {
        Verb::Id => handle_id(registry, conn_id, &args, config),
        Verb::MetaKey => handle_metakey(registry, conn_id, &args, config, identity),
        Verb::Challenge => handle_challenge(registry, conn_id, &args, identity),
        Verb::ChalReply => handle_chal_reply(registry, conn_id, &args),
        Verb::Ack => handle_ack(registry, conn_id, &args, config),
        Verb::Status => handle_status(&args),
        Verb::Error => handle_error_verb(&args),
        Verb::TermReq => handle_termreq(conn_id),
        Verb::Ping => handle_ping(registry, conn_id, now),
        Verb::Pong => handle_pong(registry, conn_id, now),
        Verb::AddSubnet => handle_add_subnet(registry, conn_id, &args, now, config),
        Verb::DelSubnet => handle_del_subnet(registry, conn_id, &args, now),
        Verb::AddEdge => handle_add_edge(registry, conn_id, line, &args, now, config),
        Verb::DelEdge => handle_del_edge(registry, conn_id, line, &args, now),
        Verb::KeyChanged => handle_key_changed(registry, conn_id, line, &args, now),
        Verb::ReqKey => handle_req_key(registry, conn_id, line, &args, now, config),
        Verb::AnsKey => handle_ans_key(registry, conn_id, &args, config, identity),
        Verb::Packet => Err(Error::Protocol("PACKET must be framed as opaque bytes, not a bare line".into())),
    }
}

fn permit_allows(permit: AllowRequest, verb: Verb) -> bool {
    if permit == AllowRequest::All {
        return !matches!(verb, Verb::Id | Verb::MetaKey | Verb::Challenge | Verb::ChalReply);
    }
    match (permit, verb) {
        (AllowRequest::Id, Verb::Id) => true,
        (AllowRequest::MetaKey, Verb::MetaKey) => true,
        (AllowRequest::Challenge, Verb::Challenge) => true,
        (AllowRequest::ChalReply, Verb::ChalReply) => true,
        (AllowRequest::Ack, Verb::Ack) => true,
        _ => false,
    }
}

fn conn_peer_name(registry: &Registry, conn_id: u64) -> Result<String> {
    registry
        .connection(conn_id)
        .and_then(|c| c.peer_name.clone())
        .ok_or_else(|| Error::Protocol("connection has no authenticated peer name yet".into()))
}

// ---- handshake ----

fn handle_id(registry: &mut Registry, conn_id: u64, args: &[&str], config: &ProtocolConfig) -> Result<Vec<Effect>> {
    let name = *args.first().ok_or_else(|| Error::Protocol("ID missing name".into()))?;
    if !check_id(name) {
        return Err(Error::Protocol(format!("invalid node name: {}", name)));
    }
    if name == registry.self_name {
        return Err(Error::Protocol("peer announced our own name".into()));
    }

    registry.node_or_create(name);
    let conn = registry.connection_mut(conn_id).ok_or_else(|| Error::Protocol("unknown connection".into()))?;
    conn.peer_name = Some(name.to_string());
    conn.allow_request = AllowRequest::MetaKey;

    let mut effects = vec![Effect::Send { connection: conn_id, line: format!("{} {} {}.{}", Verb::Id as u8, registry.self_name, config.protocol_major, config.protocol_minor) }];
    effects.extend(send_metakey(registry, conn_id, name, config)?);
    Ok(effects)
}

/// Generates our half of the session key and sends it RSA-encrypted under
/// the peer's public key (spec §4.2 `METAKEY`). Silently skipped if we
/// don't have the peer's public key on file yet; `ADD_SUBNET`/edge flood
/// will have delivered it by the time a real peer reaches this permit state.
fn send_metakey(registry: &mut Registry, conn_id: u64, peer: &str, config: &ProtocolConfig) -> Result<Vec<Effect>> {
    let Some(pem) = registry.node(peer).and_then(|n| n.rsa_public_key_pem.clone()) else {
        return Ok(Vec::new());
    };
    let peer_identity = RsaIdentity::from_public_pem(&pem)?;
    let key_len = config.cipher.key_len().max(16);
    let session_key = random_bytes(key_len);
    let ciphertext = peer_identity.encrypt(&session_key)?;

    if let Some(conn) = registry.connection_mut(conn_id) {
        conn.outbound_encrypt = Some(SessionCipher::new(config.cipher, &session_key));
        conn.flags.encrypt_out = true;
    }

    Ok(vec![Effect::Send { connection: conn_id, line: format!("{} {}", Verb::MetaKey as u8, hex::encode(ciphertext)) }])
}

fn handle_metakey(registry: &mut Registry, conn_id: u64, args: &[&str], config: &ProtocolConfig, identity: &RsaIdentity) -> Result<Vec<Effect>> {
    let blob = *args.first().ok_or_else(|| Error::Protocol("METAKEY missing key material".into()))?;
    let ciphertext = hex::decode(blob).map_err(|_| Error::Protocol("METAKEY is not valid hex".into()))?;
    let session_key = identity.decrypt(&ciphertext)?;

    let peer = conn_peer_name(registry, conn_id)?;
    {
        let conn = registry.connection_mut(conn_id).ok_or_else(|| Error::Protocol("unknown connection".into()))?;
        conn.inbound_decrypt = Some(SessionCipher::new(config.cipher, &session_key));
        conn.flags.encrypt_in = true;
        conn.allow_request = AllowRequest::Challenge;
    }

    let pem = registry.node(&peer).and_then(|n| n.rsa_public_key_pem.clone()).ok_or_else(|| Error::Protocol(format!("no public key on file for {}", peer)))?;
    let peer_identity = RsaIdentity::from_public_pem(&pem)?;
    let challenge = random_bytes(32);
    let ciphertext = peer_identity.encrypt(&challenge)?;
    if let Some(conn) = registry.connection_mut(conn_id) {
        conn.pending_challenge = Some(challenge);
    }

    Ok(vec![Effect::Send { connection: conn_id, line: format!("{} {}", Verb::Challenge as u8, hex::encode(ciphertext)) }])
}

fn handle_challenge(registry: &mut Registry, conn_id: u64, args: &[&str], identity: &RsaIdentity) -> Result<Vec<Effect>> {
    let blob = *args.first().ok_or_else(|| Error::Protocol("CHALLENGE missing bytes".into()))?;
    let ciphertext = hex::decode(blob).map_err(|_| Error::Protocol("CHALLENGE is not valid hex".into()))?;
    let plaintext = identity.decrypt(&ciphertext)?;

    let conn = registry.connection_mut(conn_id).ok_or_else(|| Error::Protocol("unknown connection".into()))?;
    conn.allow_request = AllowRequest::ChalReply;
    let digest = mesh_crypto::sha1_hex(&plaintext);
    Ok(vec![Effect::Send { connection: conn_id, line: format!("{} {}", Verb::ChalReply as u8, digest) }])
}

fn handle_chal_reply(registry: &mut Registry, conn_id: u64, args: &[&str]) -> Result<Vec<Effect>> {
    let digest = *args.first().ok_or_else(|| Error::Protocol("CHAL_REPLY missing digest".into()))?;
    let conn = registry.connection_mut(conn_id).ok_or_else(|| Error::Protocol("unknown connection".into()))?;
    let expected = conn.pending_challenge.take().ok_or_else(|| Error::Protocol("CHAL_REPLY with no outstanding challenge".into()))?;
    if mesh_crypto::sha1_hex(&expected) != digest {
        return Err(Error::Protocol("challenge reply digest mismatch".into()));
    }
    conn.allow_request = AllowRequest::Ack;
    Ok(vec![Effect::Send { connection: conn_id, line: format!("{} 0 session1", Verb::Ack as u8) }])
}

fn handle_ack(registry: &mut Registry, conn_id: u64, _args: &[&str], config: &ProtocolConfig) -> Result<Vec<Effect>> {
    let peer = conn_peer_name(registry, conn_id)?;
    {
        let conn = registry.connection_mut(conn_id).ok_or_else(|| Error::Protocol("unknown connection".into()))?;
        conn.allow_request = AllowRequest::All;
        conn.flags.active = true;
    }
    if let Some(node) = registry.node_mut(&peer) {
        node.mark_has_connection(true);
        node.session.valid_key = true;
    }

    let self_name = registry.self_name.clone();
    let mut edge = Edge::new(self_name.clone(), peer.clone(), config.edge_weight);
    edge.nonce = random_token();
    registry.add_edge(edge.clone());
    let reverse_hint = Edge::new(peer.clone(), self_name.clone(), config.edge_weight);
    registry.add_edge(reverse_hint);

    let line = format!("{} {} {} {}", Verb::AddEdge as u8, edge.from, edge.to, edge.weight);
    Ok(vec![Effect::Broadcast { exclude: conn_id, line }])
}

// ---- control verbs ----

fn handle_status(_args: &[&str]) -> Result<Vec<Effect>> {
    Ok(Vec::new())
}

fn handle_error_verb(_args: &[&str]) -> Result<Vec<Effect>> {
    Err(Error::Protocol("peer reported ERROR".into()))
}

fn handle_termreq(conn_id: u64) -> Result<Vec<Effect>> {
    Ok(vec![Effect::Terminate { connection: conn_id, reason: "TERMREQ".into() }])
}

fn handle_ping(registry: &mut Registry, conn_id: u64, now: i64) -> Result<Vec<Effect>> {
    if let Some(conn) = registry.connection_mut(conn_id) {
        conn.last_ping_time = now;
        conn.flags.pinged = false;
    }
    Ok(vec![Effect::Send { connection: conn_id, line: format!("{}", Verb::Pong as u8) }])
}

fn handle_pong(registry: &mut Registry, conn_id: u64, now: i64) -> Result<Vec<Effect>> {
    if let Some(conn) = registry.connection_mut(conn_id) {
        conn.last_ping_time = now;
        conn.flags.pinged = false;
    }
    Ok(Vec::new())
}

// ---- subnet flood + authority (protocol_subnet.c) ----

fn handle_add_subnet(registry: &mut Registry, conn_id: u64, args: &[&str], now: i64, config: &ProtocolConfig) -> Result<Vec<Effect>> {
    let owner = *args.first().ok_or_else(|| Error::Protocol("ADD_SUBNET missing owner".into()))?;
    let subnet_str = args.get(1).ok_or_else(|| Error::Protocol("ADD_SUBNET missing subnet".into()))?;
    if !check_id(owner) {
        return Err(Error::Protocol(format!("invalid subnet owner name: {}", owner)));
    }
    let full_request = format!("ADD_SUBNET {} {}", owner, subnet_str);
    if !registry.seen_request(&full_request, now) {
        return Ok(Vec::new());
    }

    // Authority rule: we are the only authority for our own subnets.
    if owner == registry.self_name {
        return Ok(vec![Effect::Send { connection: conn_id, line: format!("{} {} {}", Verb::DelSubnet as u8, owner, subnet_str) }]);
    }

    let subnet = Subnet::parse_wire_string(owner, subnet_str).map_err(Error::Protocol)?;

    if config.tunnel_server {
        let peer = conn_peer_name(registry, conn_id)?;
        if owner != peer {
            return Err(Error::Protocol(format!("tunnel-server peer {} asserted subnet for unauthorized owner {}", peer, owner)));
        }
    }

    registry.node_or_create(owner);
    registry.add_subnet(subnet);

    Ok(vec![Effect::Broadcast { exclude: conn_id, line: full_request }])
}

fn handle_del_subnet(registry: &mut Registry, conn_id: u64, args: &[&str], now: i64) -> Result<Vec<Effect>> {
    let owner = *args.first().ok_or_else(|| Error::Protocol("DEL_SUBNET missing owner".into()))?;
    let subnet_str = args.get(1).ok_or_else(|| Error::Protocol("DEL_SUBNET missing subnet".into()))?;
    let full_request = format!("DEL_SUBNET {} {}", owner, subnet_str);
    if !registry.seen_request(&full_request, now) {
        return Ok(Vec::new());
    }

    if owner == registry.self_name {
        return Ok(Vec::new());
    }

    if let Ok(key) = subnet_str.split('#').next().unwrap_or(subnet_str).parse() {
        registry.remove_subnet(&key);
    }

    Ok(vec![Effect::Broadcast { exclude: conn_id, line: full_request }])
}

// ---- edge flood ----

fn handle_add_edge(registry: &mut Registry, conn_id: u64, full_line: &str, args: &[&str], now: i64, config: &ProtocolConfig) -> Result<Vec<Effect>> {
    if args.len() < 3 {
        return Err(Error::Protocol("ADD_EDGE requires from, to, weight".into()));
    }
    if !registry.seen_request(full_line, now) {
        return Ok(Vec::new());
    }
    let (from, to) = (args[0], args[1]);
    let weight: u32 = args[2].parse().map_err(|_| Error::Protocol("ADD_EDGE weight not numeric".into()))?;

    if config.tunnel_server {
        let peer = conn_peer_name(registry, conn_id)?;
        if from != peer && from != registry.self_name {
            return Err(Error::Protocol(format!("tunnel-server peer {} asserted edge from unauthorized node {}", peer, from)));
        }
    }

    registry.add_edge(Edge::new(from, to, weight));
    Ok(vec![Effect::Broadcast { exclude: conn_id, line: full_line.to_string() }])
}

fn handle_del_edge(registry: &mut Registry, conn_id: u64, full_line: &str, args: &[&str], now: i64) -> Result<Vec<Effect>> {
    if args.len() < 2 {
        return Err(Error::Protocol("DEL_EDGE requires from, to".into()));
    }
    if !registry.seen_request(full_line, now) {
        return Ok(Vec::new());
    }
    registry.remove_edge(args[0], args[1]);
    Ok(vec![Effect::Broadcast { exclude: conn_id, line: full_line.to_string() }])
}

// ---- key distribution ----

fn handle_key_changed(registry: &mut Registry, conn_id: u64, full_line: &str, args: &[&str], now: i64) -> Result<Vec<Effect>> {
    let from = *args.first().ok_or_else(|| Error::Protocol("KEY_CHANGED missing from".into()))?;
    if !registry.seen_request(full_line, now) {
        return Ok(Vec::new());
    }
    if let Some(node) = registry.node_mut(from) {
        node.session.valid_key = false;
    }
    Ok(vec![Effect::Broadcast { exclude: conn_id, line: full_line.to_string() }])
}

/// `REQ_KEY from to`: spec §4.2. If `to == self`, answer directly; else
/// forward toward `to`'s current next-hop, revalidated at forward time
/// (spec §9 redesign note: "the forwarder revalidates the route at send
/// time" rather than caching the route from the original request).
fn handle_req_key(registry: &mut Registry, conn_id: u64, full_line: &str, args: &[&str], now: i64, config: &ProtocolConfig) -> Result<Vec<Effect>> {
    if args.len() < 2 {
        return Err(Error::Protocol("REQ_KEY requires from, to".into()));
    }
    let (from, to) = (args[0], args[1]);
    if !registry.seen_request(full_line, now) {
        return Ok(Vec::new());
    }

    if to == registry.self_name {
        let pem = registry.node(from).and_then(|n| n.rsa_public_key_pem.clone()).ok_or_else(|| Error::Protocol(format!("no public key on file for {}", from)))?;
        let peer_identity = RsaIdentity::from_public_pem(&pem)?;
        let key_len = config.cipher.key_len().max(16);
        let session_key = random_bytes(key_len);
        let ciphertext = peer_identity.encrypt(&session_key)?;

        if let Some(node) = registry.node_mut(from) {
            node.udp_cipher = Some(SessionCipher::new(config.cipher, &session_key));
            node.udp_mac = Some(SessionMac::new(config.digest, &session_key, config.mac_length));
            node.session.valid_key = true;
            node.session.waiting_for_key = false;
            node.session.cipher = Some(config.cipher);
            node.session.digest = Some(config.digest);
            node.session.mac_len = config.mac_length;
        }

        let line = format!(
            "{} {} {} {} {} {}",
            Verb::AnsKey as u8,
            registry.self_name,
            from,
            hex::encode(ciphertext),
            config.cipher.name(),
            config.digest.name(),
        );
        return Ok(vec![Effect::Send { connection: conn_id, line }]);
    }

    forward_toward(registry, conn_id, to, full_line)
}

fn handle_ans_key(registry: &mut Registry, conn_id: u64, args: &[&str], config: &ProtocolConfig, identity: &RsaIdentity) -> Result<Vec<Effect>> {
    if args.len() < 3 {
        return Err(Error::Protocol("ANS_KEY requires from, to, key".into()));
    }
    let (from, to) = (args[0], args[1]);
    let full_line = format!("{} {}", Verb::AnsKey as u8, args.join(" "));

    if to == registry.self_name {
        let ciphertext = hex::decode(args[2]).map_err(|_| Error::Protocol("ANS_KEY key field is not valid hex".into()))?;
        let session_key = identity.decrypt(&ciphertext)?;
        let cipher = args.get(3).and_then(|s| CipherKind::from_name(s)).unwrap_or(config.cipher);
        let digest = args.get(4).and_then(|s| DigestKind::from_name(s)).unwrap_or(config.digest);

        if let Some(node) = registry.node_mut(from) {
            node.udp_cipher = Some(SessionCipher::new(cipher, &session_key));
            node.udp_mac = Some(SessionMac::new(digest, &session_key, config.mac_length));
            node.session.valid_key = true;
            node.session.waiting_for_key = false;
            node.session.cipher = Some(cipher);
            node.session.digest = Some(digest);
            node.session.mac_len = config.mac_length;
        }
        return Ok(Vec::new());
    }

    forward_toward(registry, conn_id, to, &full_line)
}

/// Looks up `to`'s *current* nexthop connection and forwards, rather than
/// trusting any route captured when the original request was seen.
fn forward_toward(registry: &Registry, from_conn: u64, to: &str, line: &str) -> Result<Vec<Effect>> {
    let node = registry.node(to).ok_or_else(|| Error::Protocol(format!("forward target {} unknown", to)))?;
    if !node.session.reachable {
        return Err(Error::Protocol(format!("forward target {} unreachable", to)));
    }
    let nexthop = node.nexthop.clone();
    let target_conn = registry
        .connection_for_peer(&nexthop)
        .ok_or_else(|| Error::Protocol(format!("no active connection toward nexthop {}", nexthop)))?;
    if target_conn.id == from_conn {
        return Ok(Vec::new());
    }
    Ok(vec![Effect::Send { connection: target_conn.id, line: line.to_string() }])
}

fn random_token() -> String {
    use rand::RngCore;
    let mut bytes = [0_u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn random_bytes(n: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0_u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::connection::Connection;

    fn setup_pair() -> (Registry, u64) {
        let mut reg = Registry::new("a");
        let conn = Connection::new(reg.allocate_connection_id(), "127.0.0.1:655".parse().unwrap(), false, 64 * 1024);
        let id = reg.insert_connection(conn);
        (reg, id)
    }

    fn test_identity() -> RsaIdentity {
        RsaIdentity::generate(2048).unwrap()
    }

    #[test]
    fn check_id_rejects_non_alnum() {
        assert!(check_id("node_1"));
        assert!(!check_id("bad name"));
        assert!(!check_id(""));
        assert!(!check_id(&"x".repeat(65)));
    }

    #[test]
    fn handshake_reaches_active_and_floods_add_edge() {
        let (mut reg, id) = setup_pair();
        let config = ProtocolConfig::default();
        let self_identity = test_identity();
        let peer_identity = test_identity();
        reg.node_or_create("b").rsa_public_key_pem = Some(peer_identity.to_public_pem().unwrap());

        handle_line(&mut reg, id, "0 b 17.7", 0, &config, &self_identity).unwrap();

        let metakey_plain = b"0123456789abcdef";
        let metakey_ct = self_identity.encrypt(metakey_plain).unwrap();
        let effects = handle_line(&mut reg, id, &format!("1 {}", hex::encode(metakey_ct)), 0, &config, &self_identity).unwrap();
        let challenge_ct = effects
            .iter()
            .find_map(|e| match e {
                Effect::Send { line, .. } if line.starts_with("2 ") => Some(line[2..].to_string()),
                _ => None,
            })
            .expect("expected CHALLENGE effect");
        let challenge_plain = peer_identity.decrypt(&hex::decode(challenge_ct).unwrap()).unwrap();

        let peer_challenge_plain = b"peer-challenge-bytes";
        let peer_challenge_ct = self_identity.encrypt(peer_challenge_plain).unwrap();
        handle_line(&mut reg, id, &format!("2 {}", hex::encode(peer_challenge_ct)), 0, &config, &self_identity).unwrap();

        let digest = mesh_crypto::sha1_hex(&challenge_plain);
        let effects = handle_line(&mut reg, id, &format!("3 {}", digest), 0, &config, &self_identity).unwrap();
        assert!(matches!(effects[0], Effect::Send { .. }));

        let effects = handle_line(&mut reg, id, "4 0 sess", 0, &config, &self_identity).unwrap();
        assert!(reg.connection(id).unwrap().flags.active);
        assert!(matches!(effects[0], Effect::Broadcast { .. }));
    }

    #[test]
    fn out_of_permit_verb_is_fatal() {
        let (mut reg, id) = setup_pair();
        let config = ProtocolConfig::default();
        assert!(handle_line(&mut reg, id, "4 0 sess", 0, &config, &test_identity()).is_err());
    }

    #[test]
    fn self_owned_subnet_triggers_retaliation() {
        let (mut reg, id) = setup_pair();
        let config = ProtocolConfig::default();
        let effects = handle_add_subnet(&mut reg, id, &["a", "10.0.0.0/24"], 0, &config).unwrap();
        assert!(matches!(&effects[0], Effect::Send { line, .. } if line.starts_with("11 ")));
        assert!(reg.subnet(&"10.0.0.0/24".parse().unwrap()).is_none());
    }

    #[test]
    fn duplicate_add_subnet_is_a_no_op_second_time() {
        let (mut reg, id) = setup_pair();
        let config = ProtocolConfig::default();
        let e1 = handle_add_subnet(&mut reg, id, &["b", "10.0.0.0/24"], 0, &config).unwrap();
        assert!(!e1.is_empty());
        let e2 = handle_add_subnet(&mut reg, id, &["b", "10.0.0.0/24"], 1, &config).unwrap();
        assert!(e2.is_empty());
    }

    #[test]
    fn add_edge_flood_is_deduped_by_exact_text() {
        let (mut reg, id) = setup_pair();
        let line = "12 a b 1";
        // ADD_EDGE is only allowed once the permit has progressed to All.
        reg.connection_mut(id).unwrap().allow_request = AllowRequest::All;
        let identity = test_identity();
        let e1 = handle_line(&mut reg, id, line, 0, &ProtocolConfig::default(), &identity).unwrap();
        assert!(!e1.is_empty());
        let e2 = handle_line(&mut reg, id, line, 1, &ProtocolConfig::default(), &identity).unwrap();
        assert!(e2.is_empty());
    }
}
