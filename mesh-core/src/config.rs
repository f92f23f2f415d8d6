//! Configuration model (spec §6 "Configuration options"). Two related but
//! separate things live here: `Config`, the typed set of daemon-wide knobs
//! (serialized as JSON, mirroring the teacher's
//! `zerotier-system-service::localconfig::Config`), and `parse_conf_text`, a
//! hand-written parser for the legacy `Name = value`-per-line `tinc.conf`/
//! `hosts/<Name>` text format (spec §6; grounded on
//! `original_source/src/net_setup.c`'s config-line reader, since that format
//! predates this daemon and has no JSON-native analogue). Reading the file
//! off disk is `mesh-service::datadir`'s job; this module only parses text
//! already in memory, keeping it unit-testable without a filesystem.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::connmgr::ProxyKind;
use crate::routing::{BroadcastPolicy, Mode};

/// Daemon-wide configuration (spec §6). Every field has the spec's named
/// default; absent keys in a parsed `tinc.conf` fall back to these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub port: u16,
    pub bind_to_address: Option<String>,
    pub connect_to: Vec<String>,
    pub mode: ConfigMode,
    pub forwarding: bool,
    pub broadcast: ConfigBroadcast,
    pub indirect_data: bool,
    pub tcp_only: bool,
    pub direct_only: bool,
    pub local_discovery: bool,
    pub pmtu_discovery: bool,
    pub clamp_mss: bool,
    pub priority_inheritance: bool,
    pub decrement_ttl: bool,
    pub mac_expire_secs: i64,
    pub max_timeout_secs: i64,
    pub ping_interval_secs: i64,
    pub ping_timeout_secs: i64,
    pub key_expire_secs: i64,
    pub mac_length: usize,
    pub max_output_buffer_size: usize,
    pub udp_rcv_buf: Option<usize>,
    pub udp_snd_buf: Option<usize>,
    pub replay_window: u32,
    pub cipher: String,
    pub digest: String,
    pub compression: u8,
    pub address_family: AddressFamily,
    pub hostnames: bool,
    pub strict_subnets: bool,
    pub tunnel_server: bool,
    pub experimental_protocol: bool,
    pub proxy: Option<ProxyConfig>,
    pub device_type: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            port: 655,
            bind_to_address: None,
            connect_to: Vec::new(),
            mode: ConfigMode::Switch,
            forwarding: true,
            broadcast: ConfigBroadcast::Mst,
            indirect_data: false,
            tcp_only: false,
            direct_only: false,
            local_discovery: false,
            pmtu_discovery: true,
            clamp_mss: false,
            priority_inheritance: false,
            decrement_ttl: false,
            mac_expire_secs: 600,
            max_timeout_secs: 900,
            ping_interval_secs: 60,
            ping_timeout_secs: 5,
            key_expire_secs: 3600,
            mac_length: 4,
            max_output_buffer_size: 1024 * 1024,
            udp_rcv_buf: None,
            udp_snd_buf: None,
            replay_window: 32,
            cipher: "blowfish".to_string(),
            digest: "sha1".to_string(),
            compression: 0,
            address_family: AddressFamily::Any,
            hostnames: false,
            strict_subnets: false,
            tunnel_server: false,
            experimental_protocol: false,
            proxy: None,
            device_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigMode {
    Hub,
    Switch,
    Router,
}

impl From<ConfigMode> for Mode {
    fn from(m: ConfigMode) -> Self {
        match m {
            ConfigMode::Hub => Mode::Hub,
            ConfigMode::Switch => Mode::Switch,
            ConfigMode::Router => Mode::Router,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigBroadcast {
    No,
    Mst,
    Direct,
}

impl From<ConfigBroadcast> for BroadcastPolicy {
    fn from(b: ConfigBroadcast) -> Self {
        match b {
            ConfigBroadcast::No => BroadcastPolicy::None,
            ConfigBroadcast::Mst => BroadcastPolicy::Mst,
            ConfigBroadcast::Direct => BroadcastPolicy::Direct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Any,
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKindConfig,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKindConfig {
    Socks4,
    Socks4a,
    Socks5,
    Http,
}

impl From<ProxyKindConfig> for ProxyKind {
    fn from(k: ProxyKindConfig) -> Self {
        match k {
            ProxyKindConfig::Socks4 => ProxyKind::Socks4,
            ProxyKindConfig::Socks4a => ProxyKind::Socks4a,
            ProxyKindConfig::Socks5 => ProxyKind::Socks5,
            ProxyKindConfig::Http => ProxyKind::Http,
        }
    }
}

/// Parse `tinc.conf`/`hosts/<Name>`-style text: one `Key = Value` per line,
/// `#` comments, blank lines ignored. Unknown keys are collected rather
/// than rejected (`hosts/<Name>` files carry `Subnet =` and key-material
/// lines that don't belong on `Config` itself).
pub fn parse_conf_text(text: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in text.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        out.entry(key).or_default().push(value);
    }
    out
}

/// Apply a parsed `tinc.conf` (single-valued keys only; `ConnectTo` is the
/// one key spec §6 allows to repeat) onto a `Config`, leaving fields the
/// file doesn't mention at their `Default`.
pub fn apply_conf(config: &mut Config, parsed: &HashMap<String, Vec<String>>) {
    let first = |k: &str| parsed.get(k).and_then(|v| v.first()).cloned();

    if let Some(v) = first("Name") {
        config.name = v;
    }
    if let Some(v) = first("Port").and_then(|v| v.parse().ok()) {
        config.port = v;
    }
    if let Some(v) = first("BindToAddress") {
        config.bind_to_address = Some(v);
    }
    if let Some(values) = parsed.get("ConnectTo") {
        config.connect_to = values.clone();
    }
    if let Some(v) = first("Mode") {
        config.mode = match v.to_lowercase().as_str() {
            "hub" => ConfigMode::Hub,
            "router" => ConfigMode::Router,
            _ => ConfigMode::Switch,
        };
    }
    if let Some(v) = first("Forwarding") {
        config.forwarding = parse_bool(&v, config.forwarding);
    }
    if let Some(v) = first("Broadcast") {
        config.broadcast = match v.to_lowercase().as_str() {
            "no" => ConfigBroadcast::No,
            "direct" => ConfigBroadcast::Direct,
            _ => ConfigBroadcast::Mst,
        };
    }
    if let Some(v) = first("IndirectData") {
        config.indirect_data = parse_bool(&v, config.indirect_data);
    }
    if let Some(v) = first("TCPOnly") {
        config.tcp_only = parse_bool(&v, config.tcp_only);
    }
    if let Some(v) = first("DirectOnly") {
        config.direct_only = parse_bool(&v, config.direct_only);
    }
    if let Some(v) = first("LocalDiscovery") {
        config.local_discovery = parse_bool(&v, config.local_discovery);
    }
    if let Some(v) = first("PMTUDiscovery") {
        config.pmtu_discovery = parse_bool(&v, config.pmtu_discovery);
    }
    if let Some(v) = first("ClampMSS") {
        config.clamp_mss = parse_bool(&v, config.clamp_mss);
    }
    if let Some(v) = first("PriorityInheritance") {
        config.priority_inheritance = parse_bool(&v, config.priority_inheritance);
    }
    if let Some(v) = first("DecrementTTL") {
        config.decrement_ttl = parse_bool(&v, config.decrement_ttl);
    }
    if let Some(v) = first("MACExpire").and_then(|v| v.parse().ok()) {
        config.mac_expire_secs = v;
    }
    if let Some(v) = first("MaxTimeout").and_then(|v| v.parse().ok()) {
        config.max_timeout_secs = v;
    }
    if let Some(v) = first("PingInterval").and_then(|v| v.parse().ok()) {
        config.ping_interval_secs = v;
    }
    if let Some(v) = first("PingTimeout").and_then(|v| v.parse().ok()) {
        config.ping_timeout_secs = v;
    }
    if let Some(v) = first("KeyExpire").and_then(|v| v.parse().ok()) {
        config.key_expire_secs = v;
    }
    if let Some(v) = first("MACLength").and_then(|v| v.parse().ok()) {
        config.mac_length = v;
    }
    if let Some(v) = first("MaxOutputBufferSize").and_then(|v| v.parse().ok()) {
        config.max_output_buffer_size = v;
    }
    if let Some(v) = first("UDPRcvBuf").and_then(|v| v.parse().ok()) {
        config.udp_rcv_buf = Some(v);
    }
    if let Some(v) = first("UDPSndBuf").and_then(|v| v.parse().ok()) {
        config.udp_snd_buf = Some(v);
    }
    if let Some(v) = first("ReplayWindow").and_then(|v| v.parse().ok()) {
        config.replay_window = v;
    }
    if let Some(v) = first("Cipher") {
        config.cipher = v;
    }
    if let Some(v) = first("Digest") {
        config.digest = v;
    }
    if let Some(v) = first("Compression").and_then(|v| v.parse().ok()) {
        config.compression = v;
    }
    if let Some(v) = first("AddressFamily") {
        config.address_family = match v.to_lowercase().as_str() {
            "ipv4" => AddressFamily::Ipv4,
            "ipv6" => AddressFamily::Ipv6,
            _ => AddressFamily::Any,
        };
    }
    if let Some(v) = first("Hostnames") {
        config.hostnames = parse_bool(&v, config.hostnames);
    }
    if let Some(v) = first("StrictSubnets") {
        config.strict_subnets = parse_bool(&v, config.strict_subnets);
    }
    if let Some(v) = first("TunnelServer") {
        config.tunnel_server = parse_bool(&v, config.tunnel_server);
    }
    if let Some(v) = first("ExperimentalProtocol") {
        config.experimental_protocol = parse_bool(&v, config.experimental_protocol);
    }
    if let Some(v) = first("DeviceType") {
        config.device_type = Some(v);
    }
}

fn parse_bool(v: &str, fallback: bool) -> bool {
    match v.to_lowercase().as_str() {
        "yes" | "true" | "1" => true,
        "no" | "false" | "0" => false,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_connect_to_and_scalar_keys() {
        let text = "Name = alice\nConnectTo = bob\nConnectTo = carol\nPort = 12345\n# a comment\nMode = router\n";
        let parsed = parse_conf_text(text);
        assert_eq!(parsed.get("ConnectTo").unwrap(), &vec!["bob".to_string(), "carol".to_string()]);

        let mut config = Config::default();
        apply_conf(&mut config, &parsed);
        assert_eq!(config.name, "alice");
        assert_eq!(config.port, 12345);
        assert_eq!(config.mode, ConfigMode::Router);
        assert_eq!(config.connect_to, vec!["bob".to_string(), "carol".to_string()]);
    }

    #[test]
    fn unset_keys_keep_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 655);
        assert!(config.pmtu_discovery);
        assert_eq!(config.broadcast, ConfigBroadcast::Mst);
    }

    #[test]
    fn inline_comments_and_blank_lines_are_ignored() {
        let text = "\n  # just a comment\nForwarding = yes # trailing comment\n";
        let parsed = parse_conf_text(text);
        let mut config = Config::default();
        apply_conf(&mut config, &parsed);
        assert!(config.forwarding);
    }
}
