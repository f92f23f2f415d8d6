//! Event reactor (C10), spec §5 "Concurrency: single-threaded cooperative
//! reactor". Unlike the teacher's `VL1Service` (one task per physical core
//! per UDP socket, state behind `tokio::sync::RwLock`), spec §5 requires all
//! `Registry`/`RoutingEngine` mutation to happen on one thread with no
//! concurrent access. This reactor runs on a `current_thread` runtime: a
//! single `tokio::select!` loop owns `Registry` outright, and each TCP
//! connection gets a pair of thin reader/writer tasks that only move raw
//! bytes across `mpsc` channels — they never touch `Registry` themselves, so
//! the mutation invariant holds even though tokio schedules them as
//! separate, cooperatively-multiplexed tasks on the same OS thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mesh_crypto::RsaIdentity;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::connmgr::{self, MaintenanceAction, PingConfig};
use crate::error::Result;
use crate::meta_io::{self, Frame};
use crate::model::connection::Connection;
use crate::protocol::{self, Effect, ProtocolConfig, Verb};
use crate::registry::Registry;
use crate::routing::{self, Mode, RoutingEngine, TransmitPlan};
use crate::script::ScriptRunner;
use crate::tapdevice::TapDevice;

const MAINTENANCE_PERIOD: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 64 * 1024;

enum ConnEvent {
    Data(u64, Vec<u8>),
    Closed(u64),
}

/// Does `line` carry a verb that mutates the edge set (`ACK`/`ADD_EDGE`/
/// `DEL_EDGE`)? Used to trigger an eager `recompute_topology` instead of
/// waiting for the next maintenance tick.
fn is_topology_verb(line: &str) -> bool {
    let Some(id) = line.split_whitespace().next().and_then(|s| s.parse::<u8>().ok()) else { return false };
    matches!(Verb::from_id(id), Some(Verb::Ack) | Some(Verb::AddEdge) | Some(Verb::DelEdge))
}

/// Reports notable internal events (state dumps, reload summaries, shutdown)
/// without tying `mesh-core` to `mesh-service`'s logging macros. Spec §9
/// "Signals" calls for a signalfd-style source feeding the reactor; this is
/// the other half, letting the reactor surface what a signal handler asked
/// for back out to whatever sink the service wires up.
pub trait ReactorLog: Send + 'static {
    fn notice(&self, message: &str);
}

pub struct NoopReactorLog;

impl ReactorLog for NoopReactorLog {
    fn notice(&self, _message: &str) {}
}

/// A signal-driven instruction (spec §9) fed into the reactor through
/// `command_sender()`. `SIGINT`'s debug-verbosity toggle touches only the
/// service's logger, not registry state, so it never needs to reach here.
pub enum ReactorCommand {
    /// `SIGALRM`/`SIGWINCH`: run the maintenance tick (ping, key rotation,
    /// past-request and stale-MAC reaping) immediately instead of waiting
    /// for the next second-tick.
    Tick,
    /// `SIGUSR1`/`SIGUSR2`: report a summary of current registry state.
    DumpState,
    /// `SIGHUP`: re-populate nodes/subnets from freshly re-read host files.
    /// Loading those files is `mesh-service`'s job (it owns `DataDir`); this
    /// just applies the result on the one thread allowed to touch `Registry`.
    Reload(Vec<NodeUpdate>),
    /// `SIGTERM`/`SIGQUIT`: stop the reactor loop cleanly.
    Shutdown,
}

/// One node's worth of freshly re-read host-file data, applied by
/// `ReactorCommand::Reload`.
pub struct NodeUpdate {
    pub name: String,
    pub rsa_public_key_pem: Option<Vec<u8>>,
    pub ecdsa_public_key_pem: Option<Vec<u8>>,
    pub address: Option<crate::util::sockaddr::MeshAddr>,
    pub subnets: Vec<crate::model::subnet::Subnet>,
}

/// Everything the reactor needs to own a live daemon instance. Construction
/// (binding sockets, opening the tap device, loading host config) is
/// `mesh-service`'s job; this struct just drives the already-open handles.
pub struct Reactor<T: TapDevice, S: ScriptRunner, L: ReactorLog = NoopReactorLog> {
    pub registry: Registry,
    pub routing: RoutingEngine,
    pub protocol_config: ProtocolConfig,
    pub ping_config: PingConfig,
    rsa_identity: Arc<RsaIdentity>,
    tap: T,
    scripts: S,
    log: L,
    tcp_listener: TcpListener,
    udp_socket: UdpSocket,
    writers: HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    dial_tx: mpsc::UnboundedSender<(TcpStream, SocketAddr)>,
    dial_rx: mpsc::UnboundedReceiver<(TcpStream, SocketAddr)>,
    command_tx: mpsc::UnboundedSender<ReactorCommand>,
    command_rx: mpsc::UnboundedReceiver<ReactorCommand>,
}

impl<T: TapDevice, S: ScriptRunner, L: ReactorLog> Reactor<T, S, L> {
    pub fn new(
        registry: Registry,
        routing: RoutingEngine,
        protocol_config: ProtocolConfig,
        ping_config: PingConfig,
        rsa_identity: Arc<RsaIdentity>,
        tap: T,
        scripts: S,
        log: L,
        tcp_listener: TcpListener,
        udp_socket: UdpSocket,
    ) -> Self {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            routing,
            protocol_config,
            ping_config,
            rsa_identity,
            tap,
            scripts,
            log,
            tcp_listener,
            udp_socket,
            writers: HashMap::new(),
            conn_tx,
            conn_rx,
            dial_tx,
            dial_rx,
            command_tx,
            command_rx,
        }
    }

    /// A sender signal-handling tasks use to feed `ReactorCommand`s in
    /// (spec §9 "Reimplement as a signalfd-style source feeding the
    /// reactor"), kept separate from `dial_tx` since these carry control
    /// instructions, not sockets to adopt.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<ReactorCommand> {
        self.command_tx.clone()
    }

    /// A sender `mesh-service`'s outgoing dialer (spec §4.6) hands completed
    /// TCP connects (post proxy-handshake) through. Kept separate from
    /// `conn_tx` because dials originate outside the reactor's own tasks —
    /// in a background loop driving `connmgr::OutgoingEntry` backoff — and
    /// still need to land back on the single mutating thread to be adopted.
    pub fn dial_sender(&self) -> mpsc::UnboundedSender<(TcpStream, SocketAddr)> {
        self.dial_tx.clone()
    }

    /// Register an already-connected outgoing socket (after any proxy
    /// handshake in `connmgr`) under a freshly allocated connection id,
    /// spawn its reader/writer tasks, and send our side's opening `ID` line
    /// (spec §4.2: "Outgoing side sends `ID name protocol_major.protocol_minor`
    /// first").
    pub fn adopt_outgoing(&mut self, stream: TcpStream, peer_addr: SocketAddr, max_outbound: usize) -> u64 {
        let id = self.registry.allocate_connection_id();
        self.registry.insert_connection(Connection::new(id, peer_addr, true, max_outbound));
        self.spawn_connection_tasks(id, stream);
        self.send_initial_id(id);
        id
    }

    fn send_initial_id(&mut self, conn_id: u64) {
        let line = format!(
            "{} {} {}.{}",
            Verb::Id as u8,
            self.registry.self_name,
            self.protocol_config.protocol_major,
            self.protocol_config.protocol_minor
        );
        if let Some(conn) = self.registry.connection_mut(conn_id) {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            let _ = meta_io::send(conn, &bytes);
        }
        self.flush_connection(conn_id);
    }

    fn spawn_connection_tasks(&mut self, id: u64, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.writers.insert(id, write_tx);

        let event_tx = self.conn_tx.clone();
        tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = event_tx.send(ConnEvent::Closed(id));
                        break;
                    }
                    Ok(n) => {
                        if event_tx.send(ConnEvent::Data(id, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Run forever.
    pub async fn run(&mut self, now_fn: impl Fn() -> i64) -> Result<()> {
        let mut maintenance = tokio::time::interval(MAINTENANCE_PERIOD);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut udp_buf = vec![0u8; 65536];
        let mut tap_buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                accepted = self.tcp_listener.accept() => {
                    if let Ok((stream, peer_addr)) = accepted {
                        let id = self.registry.allocate_connection_id();
                        let max_outbound = self.protocol_config.max_output_buffer_size;
                        self.registry.insert_connection(Connection::new(id, peer_addr, false, max_outbound));
                        self.spawn_connection_tasks(id, stream);
                    }
                }

                recv = self.udp_socket.recv_from(&mut udp_buf) => {
                    if let Ok((n, from)) = recv {
                        self.handle_udp_datagram(&udp_buf[..n], from, now_fn()).await;
                    }
                }

                read = self.tap.read_packet(&mut tap_buf) => {
                    if let Ok(n) = read {
                        self.handle_tap_frame(&tap_buf[..n], now_fn()).await;
                    }
                }

                _ = maintenance.tick() => {
                    self.run_maintenance(now_fn());
                }

                event = self.conn_rx.recv() => {
                    match event {
                        Some(ConnEvent::Data(id, bytes)) => self.handle_tcp_bytes(id, &bytes, now_fn()).await,
                        Some(ConnEvent::Closed(id)) => self.close_connection(id),
                        None => {}
                    }
                }

                dialed = self.dial_rx.recv() => {
                    if let Some((stream, peer_addr)) = dialed {
                        let max_outbound = self.protocol_config.max_output_buffer_size;
                        self.adopt_outgoing(stream, peer_addr, max_outbound);
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(ReactorCommand::Tick) => self.run_maintenance(now_fn()),
                        Some(ReactorCommand::DumpState) => self.dump_state(),
                        Some(ReactorCommand::Reload(updates)) => self.apply_reload(updates),
                        Some(ReactorCommand::Shutdown) => return Ok(()),
                        None => {}
                    }
                }
            }
        }
    }

    /// `SIGUSR1`/`SIGUSR2`: log a one-line summary of current registry size.
    fn dump_state(&self) {
        self.log.notice(&format!(
            "state: {} nodes, {} edges, {} subnets, {} connections ({} active), {} pending past-requests",
            self.registry.node_names().count(),
            self.registry.all_edges().count(),
            self.registry.all_subnets().count(),
            self.registry.connections().count(),
            self.registry.active_connections().count(),
            self.registry.past_request_count(),
        ));
    }

    /// `SIGHUP`: apply freshly re-read host-file data (spec §9 "Signals").
    /// Mirrors the initial population loop in `mesh-service::service::run_async`.
    fn apply_reload(&mut self, updates: Vec<NodeUpdate>) {
        let count = updates.len();
        for update in updates {
            let node = self.registry.node_or_create(&update.name);
            node.rsa_public_key_pem = update.rsa_public_key_pem;
            node.ecdsa_public_key_pem = update.ecdsa_public_key_pem;
            node.address = update.address;
            for subnet in update.subnets {
                self.registry.add_subnet(subnet);
            }
        }
        self.log.notice(&format!("reloaded {} host entries", count));
    }

    /// UDP data-channel datagram (spec §4.5). Looks up the sending node by
    /// address and hands it to `deliver_tunnel_datagram`.
    async fn handle_udp_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: i64) {
        let Some(peer_name) = self.registry.node_by_udp_address(&from).map(|s| s.to_string()) else {
            return;
        };
        self.deliver_tunnel_datagram(&peer_name, datagram, now).await;
    }

    /// Shared decode-and-deliver path for both a UDP datagram and a TCP
    /// `PACKET` fallback payload (spec §4.5, §6: "same wire format" on
    /// either transport). Decodes under `peer_name`'s data-channel session
    /// key, if one has been installed, and writes the plaintext frame to
    /// the tap device.
    async fn deliver_tunnel_datagram(&mut self, peer_name: &str, datagram: &[u8], now: i64) {
        let Some(node) = self.registry.node_mut(peer_name) else { return };
        node.touch_seen(now);
        let Some(cipher) = node.udp_cipher.take() else { return };
        let Some(mac) = node.udp_mac.take() else {
            node.udp_cipher = Some(cipher);
            return;
        };
        let compression = mesh_crypto::CompressionLevel(node.session.compression_level);
        let decoded = crate::packet_io::decode(node, &cipher, &mac, compression, datagram, 65536);
        node.udp_cipher = Some(cipher);
        node.udp_mac = Some(mac);

        if let Ok(plaintext) = decoded {
            let _ = self.tap.write_packet(&plaintext).await;
        }
    }

    /// A frame read off the tap device (spec §4.4). Learns the source MAC,
    /// resolves the destination by routing mode, and transmits the encoded
    /// packet to each target per `routing::plan_transmit`.
    async fn handle_tap_frame(&mut self, frame: &[u8], now: i64) {
        if frame.len() < 12 {
            return;
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        let mut src = [0u8; 6];
        src.copy_from_slice(&frame[6..12]);
        let dst_mac = crate::model::subnet::MacAddr(dst);
        let src_mac = crate::model::subnet::MacAddr(src);
        self.routing.learn_mac(src_mac, &self.registry.self_name, now);

        let dest_name = match self.routing.mode {
            Mode::Switch => self.routing.resolve_switch(dst_mac).map(|s| s.to_string()),
            Mode::Hub => None,
            Mode::Router => routing::dest_ip_from_ipv4(frame).and_then(|ip| match ip {
                std::net::IpAddr::V4(v4) => self.routing.resolve_router_ipv4(&self.registry, v4),
                _ => None,
            }),
        };

        let targets: Vec<String> = match dest_name {
            Some(name) => vec![name],
            None => self.routing.broadcast_targets(&self.registry),
        };

        for target in targets {
            let plan = routing::plan_transmit(&self.registry, &target);
            self.transmit_to(&target, &plan, frame).await;
        }
    }

    /// Sends an encoded tunnel packet per `plan`: direct UDP to the node's
    /// own address, UDP to the via-node's address when indirect (encoded
    /// under the real destination's key, not the via-node's — the via-node
    /// only relays the opaque datagram), or the TCP `PACKET` fallback.
    async fn transmit_to(&mut self, target: &str, plan: &TransmitPlan, frame: &[u8]) {
        let address = match plan {
            TransmitPlan::DirectUdp { address, .. } => *address,
            TransmitPlan::ViaNode { via } => match self.registry.node(via).and_then(|n| n.address.as_ref()).and_then(|a| a.resolved()) {
                Some(addr) => addr,
                None => return,
            },
            TransmitPlan::TcpFallback { nexthop } => {
                let Some(encoded) = self.encode_for_node(target, frame) else { return };
                self.send_tcp_packet(nexthop, &encoded);
                return;
            }
            TransmitPlan::Unreachable => return,
        };

        let Some(encoded) = self.encode_for_node(target, frame) else { return };
        let _ = self.udp_socket.send_to(&encoded, address).await;
    }

    /// Encode `frame` under `target`'s installed data-channel session key,
    /// if any. Takes the cipher/mac out of the node rather than requiring
    /// `Clone`, restoring them once encoding is done.
    fn encode_for_node(&mut self, target: &str, frame: &[u8]) -> Option<Vec<u8>> {
        let node = self.registry.node_mut(target)?;
        let cipher = node.udp_cipher.take()?;
        let Some(mac) = node.udp_mac.take() else {
            node.udp_cipher = Some(cipher);
            return None;
        };
        let compression = mesh_crypto::CompressionLevel(node.session.compression_level);
        let seqno = node.counters.out_seqno.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let encoded = crate::packet_io::encode(&cipher, &mac, compression, seqno, frame).ok();
        node.udp_cipher = Some(cipher);
        node.udp_mac = Some(mac);
        encoded
    }

    /// TCP `PACKET` fallback (spec §4.1(b), §6): frame `encoded` as
    /// `PACKET <len>` followed by the opaque bytes, queued on the
    /// connection toward `node`.
    fn send_tcp_packet(&mut self, node: &str, encoded: &[u8]) {
        let Some(conn_id) = self.registry.connection_for_peer(node).map(|c| c.id) else { return };
        if let Some(conn) = self.registry.connection_mut(conn_id) {
            let mut header = format!("{} {}", Verb::Packet as u8, encoded.len()).into_bytes();
            header.push(b'\n');
            let _ = meta_io::send(conn, &header);
            let _ = meta_io::send(conn, encoded);
        }
        self.flush_connection(conn_id);
    }

    async fn handle_tcp_bytes(&mut self, conn_id: u64, bytes: &[u8], now: i64) {
        let Some(conn) = self.registry.connection_mut(conn_id) else { return };
        let frames = match meta_io::receive(conn, bytes) {
            Ok(f) => f,
            Err(_) => {
                self.close_connection(conn_id);
                return;
            }
        };

        let mut effects = Vec::new();
        let mut topology_changed = false;
        let mut tunnel_payloads: Vec<Vec<u8>> = Vec::new();
        for frame in frames {
            match frame {
                Frame::Line(line) => {
                    if self.handle_packet_prefix(conn_id, &line) {
                        continue;
                    }
                    if is_topology_verb(&line) {
                        topology_changed = true;
                    }
                    match protocol::handle_line(&mut self.registry, conn_id, &line, now, &self.protocol_config, &self.rsa_identity) {
                        Ok(mut e) => effects.append(&mut e),
                        Err(_) => {
                            self.close_connection(conn_id);
                            return;
                        }
                    }
                }
                Frame::Packet(payload) => {
                    // TCP `PACKET` fallback payload: same treatment as a
                    // decoded UDP datagram (spec §6: same wire format).
                    tunnel_payloads.push(payload);
                }
            }
        }

        self.apply_effects(effects);
        self.flush_connection(conn_id);

        if !tunnel_payloads.is_empty() {
            if let Some(peer_name) = self.registry.connection(conn_id).and_then(|c| c.peer_name.clone()) {
                for payload in tunnel_payloads {
                    self.deliver_tunnel_datagram(&peer_name, &payload, now).await;
                }
            }
        }

        if topology_changed {
            self.recompute_topology();
        }
    }

    /// A `PACKET <len>` line switches the connection into opaque-byte mode
    /// for the next `len` bytes instead of being handed to `protocol`
    /// (spec §4.1(b), §6).
    fn handle_packet_prefix(&mut self, conn_id: u64, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let Some(first) = parts.next() else { return false };
        let Ok(verb_id) = first.parse::<u8>() else { return false };
        if Verb::from_id(verb_id) != Some(Verb::Packet) {
            return false;
        }
        let Some(len) = parts.next().and_then(|s| s.parse::<usize>().ok()) else { return false };
        if let Some(conn) = self.registry.connection_mut(conn_id) {
            meta_io::begin_tcp_packet(conn, len);
        }
        true
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { connection, line } => {
                    if let Some(conn) = self.registry.connection_mut(connection) {
                        let mut bytes = line.into_bytes();
                        bytes.push(b'\n');
                        let _ = meta_io::send(conn, &bytes);
                    }
                    self.flush_connection(connection);
                }
                Effect::Broadcast { exclude, line } => {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    let _ = meta_io::broadcast(self.registry.connections_mut(), exclude, &bytes);
                    let ids: Vec<u64> = self.registry.connections().map(|c| c.id).collect();
                    for id in ids {
                        self.flush_connection(id);
                    }
                }
                Effect::Terminate { connection, .. } => {
                    self.close_connection(connection);
                }
                Effect::RunScript { name, env } => {
                    self.scripts.run(&name, &env);
                }
            }
        }
    }

    fn run_maintenance(&mut self, now: i64) {
        let actions = connmgr::tick(&mut self.registry, now, &self.ping_config);
        for action in actions {
            match action {
                MaintenanceAction::SendPing { connection } => {
                    if let Some(conn) = self.registry.connection_mut(connection) {
                        let mut bytes = format!("{}", Verb::Ping as u8).into_bytes();
                        bytes.push(b'\n');
                        let _ = meta_io::send(conn, &bytes);
                    }
                    self.flush_connection(connection);
                }
                MaintenanceAction::Terminate { connection, .. } => {
                    let effects = connmgr::terminate_connection(&mut self.registry, connection);
                    self.apply_effects(effects);
                    self.close_connection(connection);
                }
                MaintenanceAction::RotateKey { .. } => {
                    let effect = connmgr::rotate_self_key(&mut self.registry);
                    self.apply_effects(vec![effect]);
                }
            }
        }

        self.recompute_topology();
        self.routing.expire_macs(now);
        self.registry.expire_subnets(now);
    }

    /// Recompute MST/SSSP and run `host-up`/`host-down` scripts for any
    /// reachability changes. Shared between the maintenance tick and
    /// `handle_tcp_bytes`'s eager recompute after `ACK`/`ADD_EDGE`/`DEL_EDGE`
    /// (spec §5: routing decisions should reflect topology before the next
    /// outbound packet, not lag up to a full maintenance period behind).
    fn recompute_topology(&mut self) {
        let reachability_changes = crate::graph::compute_graph(&mut self.registry);
        for change in reachability_changes {
            let script = if change.became_reachable { "host-up" } else { "host-down" };
            let env = vec![("NODE".to_string(), change.node)];
            self.scripts.run(script, &env);
        }
    }

    /// Pop everything queued in `conn.outbound` and hand it to that
    /// connection's writer task. `Vec<u8>` already implements
    /// `std::io::Write`, so `meta_io::flush` needs no adapter here.
    fn flush_connection(&mut self, conn_id: u64) {
        let Some(conn) = self.registry.connection_mut(conn_id) else { return };
        let mut sink = Vec::new();
        if meta_io::flush(conn, &mut sink).is_err() {
            return;
        }
        if sink.is_empty() {
            return;
        }
        if let Some(tx) = self.writers.get(&conn_id) {
            let _ = tx.send(sink);
        }
    }

    fn close_connection(&mut self, conn_id: u64) {
        let effects = connmgr::terminate_connection(&mut self.registry, conn_id);
        self.writers.remove(&conn_id);
        self.apply_effects(effects);
    }
}
