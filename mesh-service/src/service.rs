//! Setup/orchestration (C11), spec §2: "Loads host config for self and
//! peers, initialises crypto material, binds sockets, kicks off C10."
//! Grounded on the teacher's commented-out `zerotier-system-service::service`
//! reactor loop: a sync `run()` that builds its own current-thread runtime
//! and blocks on an async `run_async()`, matching spec §5's single-threaded
//! mutation requirement without forcing the whole binary onto one thread.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use mesh_core::config::Config;
use mesh_core::connmgr::{self, OutgoingEntry, PingConfig, ProxyKind};
use mesh_core::model::subnet::Subnet;
use mesh_core::protocol::ProtocolConfig;
use mesh_core::reactor::{NodeUpdate, Reactor, ReactorCommand};
use mesh_core::registry::Registry;
use mesh_core::routing::RoutingEngine;
use mesh_core::tapdevice::NullTapDevice;
use mesh_core::util::sockaddr::MeshAddr;
use mesh_crypto::{EcdsaIdentity, RsaIdentity};

use crate::datadir::DataDir;
use crate::error::{Error, Result};
use crate::logging::Log;
use crate::scripts::ProcessScriptRunner;
use crate::{d, l};

const RSA_KEY_BITS: u32 = 2048;

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn parse_mesh_addr(host: &str, port: u16) -> MeshAddr {
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => MeshAddr::from_socket_addr(SocketAddr::new(ip, port)),
        Err(_) => MeshAddr::Unresolved { host: host.to_string(), port },
    }
}

/// Entry point for the `service` CLI subcommand: build our own current-
/// thread runtime (spec §5, ambient-stack note on the reactor's scheduling
/// model) and block on it for the life of the process.
pub fn run(base_path: PathBuf, log: Arc<Log>) -> i32 {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: could not start runtime: {}", e);
            return crate::exitcode::ERR_IOERR;
        }
    };
    match rt.block_on(run_async(base_path, log.clone())) {
        Ok(()) => crate::exitcode::OK,
        Err(e) => {
            l!(log, "FATAL: {}", e);
            match e {
                Error::Config(_) => crate::exitcode::ERR_CONFIG,
                _ => crate::exitcode::ERR_IOERR,
            }
        }
    }
}

async fn run_async(base_path: PathBuf, log: Arc<Log>) -> Result<()> {
    let datadir = DataDir::open(base_path.clone())?;
    let config = datadir.load_conf()?;

    let rsa_identity = load_or_generate_rsa_identity(&datadir, &config)?;
    let ecdsa_identity = if config.experimental_protocol { Some(load_or_generate_ecdsa_identity(&datadir)?) } else { None };

    let mut registry = Registry::new(config.name.clone());
    {
        let me = registry.node_or_create(&config.name);
        me.rsa_public_key_pem = Some(rsa_identity.to_public_pem()?);
        if let Some(ecdsa) = &ecdsa_identity {
            me.ecdsa_public_key_pem = Some(ecdsa.to_public_pem()?);
        }
    }

    for update in build_node_updates(&datadir, &config.name, config.port)? {
        let node = registry.node_or_create(&update.name);
        node.rsa_public_key_pem = update.rsa_public_key_pem;
        node.ecdsa_public_key_pem = update.ecdsa_public_key_pem;
        node.address = update.address;
        for subnet in update.subnets {
            registry.add_subnet(subnet);
        }
    }

    let routing = RoutingEngine::new(config.mode.into(), config.broadcast.into());
    let protocol_config = ProtocolConfig {
        tunnel_server: config.tunnel_server,
        experimental_protocol: config.experimental_protocol,
        cipher: mesh_crypto::CipherKind::from_name(&config.cipher).unwrap_or(mesh_crypto::CipherKind::Blowfish),
        digest: mesh_crypto::DigestKind::from_name(&config.digest).unwrap_or(mesh_crypto::DigestKind::Sha1),
        mac_length: config.mac_length,
        max_output_buffer_size: config.max_output_buffer_size,
        ..ProtocolConfig::default()
    };
    let ping_config = PingConfig { ping_interval_secs: config.ping_interval_secs, ping_timeout_secs: config.ping_timeout_secs, key_expire_secs: config.key_expire_secs };

    let bind_host = config.bind_to_address.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let bind_addr = format!("{}:{}", bind_host, config.port);
    let (tcp_listener, udp_socket) = match inherited_sockets() {
        Some((tcp, udp)) => {
            tcp.set_nonblocking(true)?;
            udp.set_nonblocking(true)?;
            l!(log, "inherited {} listening sockets via LISTEN_FDS", 2);
            (TcpListener::from_std(tcp)?, UdpSocket::from_std(udp)?)
        }
        None => {
            let tcp = TcpListener::bind(&bind_addr).await?;
            let udp = UdpSocket::bind(&bind_addr).await?;
            (tcp, udp)
        }
    };
    l!(log, "{} listening on {}", config.name, bind_addr);

    let dialers = build_outgoing_dialers(&datadir, &config)?;

    let mut reactor = Reactor::new(registry, routing, protocol_config, ping_config, Arc::new(rsa_identity), NullTapDevice, ProcessScriptRunner::new(base_path), log.clone(), tcp_listener, udp_socket);

    for entry in dialers {
        let dial_tx = reactor.dial_sender();
        let log = log.clone();
        tokio::spawn(run_outgoing_dialer(entry, dial_tx, log));
    }

    spawn_signal_handlers(reactor.command_sender(), Arc::new(datadir), config.name.clone(), config.port, log.clone());

    reactor.run(now_secs).await.map_err(Error::from)
}

/// Read every peer host file under `datadir` (excluding `self_name`) into a
/// `NodeUpdate` list. Shared by the startup population loop and `SIGHUP`
/// reload, so a reload applies the exact same parsing as a fresh start.
fn build_node_updates(datadir: &DataDir, self_name: &str, default_port: u16) -> Result<Vec<NodeUpdate>> {
    let mut updates = Vec::new();
    for name in datadir.host_names()? {
        if name == self_name {
            continue;
        }
        let host = datadir.load_host_file(&name)?;
        let port = host.port.unwrap_or(default_port);
        let address = host.address.as_deref().map(|a| parse_mesh_addr(a, port));
        let subnets: Vec<Subnet> = host.subnets.iter().map(|s| Subnet::parse_wire_string(name.clone(), s)).collect::<std::result::Result<_, _>>().map_err(Error::Config)?;
        updates.push(NodeUpdate { name, rsa_public_key_pem: host.rsa_public_key_pem, ecdsa_public_key_pem: host.ecdsa_public_key_pem, address, subnets });
    }
    Ok(updates)
}

fn load_or_generate_rsa_identity(datadir: &DataDir, config: &Config) -> Result<RsaIdentity> {
    if let Some(id) = datadir.load_rsa_identity()? {
        return Ok(id);
    }
    let id = RsaIdentity::generate(RSA_KEY_BITS)?;
    datadir.save_rsa_identity(&id)?;
    datadir.write_self_host_file(&config.name, &id.to_public_pem()?, None, config.port, config.bind_to_address.as_deref())?;
    Ok(id)
}

fn load_or_generate_ecdsa_identity(datadir: &DataDir) -> Result<EcdsaIdentity> {
    if let Some(id) = datadir.load_ecdsa_identity()? {
        return Ok(id);
    }
    let id = EcdsaIdentity::generate()?;
    datadir.save_ecdsa_identity(&id)?;
    Ok(id)
}

/// Build one `OutgoingEntry` per `ConnectTo` name (spec §4.6), pulling its
/// `Address` lines and this daemon's configured proxy type from the peer's
/// host file / `tinc.conf` respectively.
fn build_outgoing_dialers(datadir: &DataDir, config: &Config) -> Result<Vec<OutgoingEntry>> {
    let proxy_kind = config.proxy.as_ref().map(|p| ProxyKind::from(p.kind)).unwrap_or(ProxyKind::None);
    let mut entries = Vec::new();
    for peer in &config.connect_to {
        let host = datadir.load_host_file(peer)?;
        let port = host.port.unwrap_or(config.port);
        let addresses: Vec<MeshAddr> = host.raw.get("Address").into_iter().flatten().map(|a| parse_mesh_addr(a, port)).collect();
        if addresses.is_empty() {
            continue;
        }
        entries.push(OutgoingEntry::new(peer.clone(), addresses, proxy_kind, config.max_timeout_secs));
    }
    Ok(entries)
}

/// Drives one `ConnectTo` entry's dial/backoff loop (spec §4.6). Runs
/// outside the reactor; successful connects are hand off through `dial_tx`
/// for the reactor thread to adopt.
///
/// TODO: re-enter this loop (rather than sleeping for `max_backoff_secs`)
/// only once connmgr reports this peer's session has actually closed.
async fn run_outgoing_dialer(mut entry: OutgoingEntry, dial_tx: mpsc::UnboundedSender<(TcpStream, SocketAddr)>, log: Arc<Log>) {
    loop {
        let now = now_secs();
        if !entry.due(now) {
            tokio::time::sleep(Duration::from_secs((entry.next_attempt_at - now).max(1) as u64)).await;
            continue;
        }
        match attempt_dial(&entry).await {
            Ok((stream, addr)) => {
                d!(log, "connected to {} at {}", entry.peer_name, addr);
                entry.record_success();
                if dial_tx.send((stream, addr)).is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(entry.max_backoff_secs as u64)).await;
            }
            Err(e) => {
                d!(log, "dial to {} failed: {}", entry.peer_name, e);
                entry.record_failure(now_secs());
            }
        }
    }
}

async fn attempt_dial(entry: &OutgoingEntry) -> Result<(TcpStream, SocketAddr)> {
    for addr in &entry.addresses {
        let candidates: Vec<SocketAddr> = match addr.resolved() {
            Some(sa) => vec![sa],
            None => {
                let host = addr.host_string();
                match tokio::net::lookup_host((host.as_str(), addr.port())).await {
                    Ok(iter) => iter.collect(),
                    Err(_) => continue,
                }
            }
        };
        for sa in candidates {
            let Ok(mut stream) = TcpStream::connect(sa).await else { continue };
            if complete_proxy_handshake(&mut stream, entry.proxy, &addr.host_string(), addr.port()).await.is_ok() {
                return Ok((stream, sa));
            }
        }
    }
    Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no reachable address for {}", entry.peer_name))))
}

/// Spec §4.6: "the handshake bytes are sent as soon as the TCP connect
/// completes and the response is parsed ... while `allow_request == ID`."
/// Here the response is parsed before `ID` is sent, since the opening `ID`
/// line is the reactor's job once the socket is handed off via `dial_tx`.
async fn complete_proxy_handshake(stream: &mut TcpStream, proxy: ProxyKind, host: &str, port: u16) -> Result<()> {
    if proxy == ProxyKind::None {
        return Ok(());
    }
    let request = connmgr::build_proxy_request(proxy, host, port);
    stream.write_all(&request).await?;

    let mut buf = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        if connmgr::parse_proxy_response(proxy, &buf)?.is_some() {
            return Ok(());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "proxy closed connection during handshake")));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Spec §9 "Signals": one spawned listener per signal kind, feeding
/// `ReactorCommand`s into the reactor's command channel (or, for `SIGINT`,
/// touching only the logger directly). Non-unix targets get none of these;
/// there is no portable equivalent to `SIGHUP`/`SIGALRM`/etc.
#[cfg(unix)]
fn spawn_signal_handlers(command_tx: mpsc::UnboundedSender<ReactorCommand>, datadir: Arc<DataDir>, self_name: String, default_port: u16, log: Arc<Log>) {
    use tokio::signal::unix::{signal, SignalKind};

    if let Ok(mut sig) = signal(SignalKind::interrupt()) {
        let log = log.clone();
        tokio::spawn(async move {
            while sig.recv().await.is_some() {
                let enabled = !log.debug_enabled();
                log.set_debug(enabled);
                l!(log, "debug verbosity {}", if enabled { "enabled" } else { "disabled" });
            }
        });
    }

    if let Ok(mut sig) = signal(SignalKind::hangup()) {
        let tx = command_tx.clone();
        let datadir = datadir.clone();
        let self_name = self_name.clone();
        tokio::spawn(async move {
            while sig.recv().await.is_some() {
                if let Ok(updates) = build_node_updates(&datadir, &self_name, default_port) {
                    let _ = tx.send(ReactorCommand::Reload(updates));
                }
            }
        });
    }

    for kind in [SignalKind::user_defined1(), SignalKind::user_defined2()] {
        if let Ok(mut sig) = signal(kind) {
            let tx = command_tx.clone();
            tokio::spawn(async move {
                while sig.recv().await.is_some() {
                    let _ = tx.send(ReactorCommand::DumpState);
                }
            });
        }
    }

    for kind in [SignalKind::alarm(), SignalKind::window_change()] {
        if let Ok(mut sig) = signal(kind) {
            let tx = command_tx.clone();
            tokio::spawn(async move {
                while sig.recv().await.is_some() {
                    let _ = tx.send(ReactorCommand::Tick);
                }
            });
        }
    }

    for kind in [SignalKind::terminate(), SignalKind::quit()] {
        if let Ok(mut sig) = signal(kind) {
            let tx = command_tx.clone();
            tokio::spawn(async move {
                sig.recv().await;
                let _ = tx.send(ReactorCommand::Shutdown);
            });
        }
    }
}

#[cfg(not(unix))]
fn spawn_signal_handlers(_command_tx: mpsc::UnboundedSender<ReactorCommand>, _datadir: Arc<DataDir>, _self_name: String, _default_port: u16, _log: Arc<Log>) {}

/// Spec §6 "Socket activation": inherit `LISTEN_FDS` sockets starting at fd
/// 3 (TCP) / fd 4 (UDP) instead of binding fresh ones.
#[cfg(unix)]
fn inherited_sockets() -> Option<(std::net::TcpListener, std::net::UdpSocket)> {
    use std::os::unix::io::FromRawFd;
    let count: i32 = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
    if count < 2 {
        return None;
    }
    unsafe { Some((std::net::TcpListener::from_raw_fd(3), std::net::UdpSocket::from_raw_fd(4))) }
}

#[cfg(not(unix))]
fn inherited_sockets() -> Option<(std::net::TcpListener, std::net::UdpSocket)> {
    None
}
