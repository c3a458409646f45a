use serde::Deserialize;

use anyhow::{bail, Context};
use l4lb_common::VipKey;
use network_types::ip::IpProto;
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::permutation::{is_prime, MAX_TABLE_SIZE};

/// A backend server, identified by address and port.
///
/// Deserializes from either `"10.0.0.1:8080"` or `{ addr: 10.0.0.1, port: 8080 }`.
#[derive(Debug, PartialEq, Deserialize, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
#[serde(try_from = "RealServerRepr")]
pub struct RealServer {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl RealServer {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        RealServer { addr, port }
    }

    /// Stable byte identity used to derive the backend's permutation.
    pub fn identity(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&self.addr.octets());
        out[4..].copy_from_slice(&self.port.to_be_bytes());
        out
    }
}

impl fmt::Display for RealServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for RealServer {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sock: SocketAddrV4 = s.parse()?;
        Ok(RealServer::new(*sock.ip(), sock.port()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RealServerRepr {
    Addr(String),
    Fields { addr: Ipv4Addr, port: u16 },
}

impl TryFrom<RealServerRepr> for RealServer {
    type Error = String;

    fn try_from(repr: RealServerRepr) -> Result<Self, Self::Error> {
        match repr {
            RealServerRepr::Addr(s) => s
                .parse()
                .map_err(|e| format!("invalid real server {s:?}: {e}")),
            RealServerRepr::Fields { addr, port } => Ok(RealServer::new(addr, port)),
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Vip {
    pub vip: Ipv4Addr,
    pub port: u16,
    #[serde(deserialize_with = "deserialize_ip_proto")]
    pub proto: IpProto,
    pub real_servers: Vec<RealServer>,
}

impl Vip {
    pub fn key(&self) -> VipKey {
        VipKey::new(u32::from(self.vip), self.port, self.proto)
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct MaglevConfig {
    /// Lookup table size. Must be prime.
    #[serde(default = "default_table_size")]
    pub table_size: u32,
    #[serde(default = "default_max_backends")]
    pub max_backends: usize,
}

impl Default for MaglevConfig {
    fn default() -> Self {
        MaglevConfig {
            table_size: default_table_size(),
            max_backends: default_max_backends(),
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct AffinityConfig {
    /// Maximum number of flows remembered per VIP.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// Flows idle for longer than this are forgotten.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl AffinityConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for AffinityConfig {
    fn default() -> Self {
        AffinityConfig {
            capacity: default_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub maglev: MaglevConfig,
    #[serde(default)]
    pub affinity: AffinityConfig,
    /// Period of the balance/affinity stats log line. 0 disables it.
    #[serde(default)]
    pub stats_interval_secs: u64,
    pub vips: Vec<Vip>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, anyhow::Error> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Config::from_yaml(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Config, anyhow::Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.maglev.table_size > MAX_TABLE_SIZE {
            bail!(
                "maglev.table_size {} exceeds the maximum of {}",
                self.maglev.table_size,
                MAX_TABLE_SIZE
            );
        }
        if !is_prime(self.maglev.table_size) {
            bail!("maglev.table_size {} is not prime", self.maglev.table_size);
        }
        if self.affinity.capacity == 0 {
            bail!("affinity.capacity must be positive");
        }
        if self.affinity.idle_timeout_secs == 0 {
            bail!("affinity.idle_timeout_secs must be positive");
        }
        if self.vips.is_empty() {
            bail!("no vips configured");
        }

        let mut keys = HashSet::new();
        for vip in &self.vips {
            if !keys.insert(vip.key()) {
                bail!("vip {}:{} ({:?}) is configured twice", vip.vip, vip.port, vip.proto);
            }
            if vip.real_servers.is_empty() {
                bail!("vip {}:{} has no real servers", vip.vip, vip.port);
            }
            if vip.real_servers.len() > self.maglev.max_backends {
                bail!(
                    "vip {}:{} has {} real servers, maglev.max_backends is {}",
                    vip.vip,
                    vip.port,
                    vip.real_servers.len(),
                    self.maglev.max_backends
                );
            }
            let mut seen = HashSet::new();
            for real in &vip.real_servers {
                if !seen.insert(real) {
                    bail!("vip {}:{} lists real server {} twice", vip.vip, vip.port, real);
                }
            }
        }
        Ok(())
    }
}

fn default_table_size() -> u32 {
    503
}

fn default_max_backends() -> usize {
    10
}

fn default_capacity() -> u64 {
    65536
}

fn default_idle_timeout_secs() -> u64 {
    300
}

pub fn parse_ip_proto(s: &str) -> Option<IpProto> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" | "6" => Some(IpProto::Tcp),
        "udp" | "17" => Some(IpProto::Udp),
        _ => None,
    }
}

fn deserialize_ip_proto<'de, D>(deserializer: D) -> Result<IpProto, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u8),
        Name(String),
    }

    let s = match Repr::deserialize(deserializer)? {
        Repr::Number(n) => n.to_string(),
        Repr::Name(name) => name,
    };
    parse_ip_proto(&s)
        .ok_or_else(|| Error::custom(format!("unsupported protocol {s:?}, expected tcp or udp")))
}
