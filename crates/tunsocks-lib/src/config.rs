// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{de, Deserialize, Deserializer};
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_TUN_NAME: &str = "tun0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file")]
    Parse(#[from] serde_yaml::Error),

    #[error("tunnel mtu must be greater than zero")]
    ZeroMtu,

    #[error("socks5 port must be in range 1-65535")]
    ZeroPort,
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Top-level engine configuration, loaded from a YAML document with `tunnel`,
/// `socks5` and `misc` sections.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tunnel: TunnelConfig,
    pub socks5: Socks5Config,
    #[serde(default)]
    pub misc: MiscConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tunnel.mtu == 0 {
            return Err(ConfigError::ZeroMtu);
        }
        if self.socks5.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    pub mtu: u16,
    #[serde(default)]
    pub multi_queue: MultiQueue,
    pub ipv4: Ipv4Network,
    #[serde(default)]
    pub ipv6: Option<Ipv6Network>,
}

fn default_tun_name() -> String {
    DEFAULT_TUN_NAME.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Socks5Config {
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub udp: UdpMode,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Socks5Config {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

/// How datagrams are relayed upstream. The embedding shim always writes
/// `'udp'`; in `tcp` mode UDP flows are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    #[default]
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MiscConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    /// Optional log destination; without it logs go to stderr.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Log level as written by the embedding application. Anything we do not
/// recognize (including `none` and the empty string) maps to `error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[default]
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(value: &str) -> Self {
        match value {
            "warn" | "warning" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Error,
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(LogLevel::from(raw.as_str()))
    }
}

/// Number of TUN queues to read from. The config file may say `true`/`false`
/// or give an explicit queue count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiQueue(u16);

impl MultiQueue {
    pub fn queues(self) -> u16 {
        self.0.max(1)
    }
}

impl Default for MultiQueue {
    fn default() -> Self {
        Self(1)
    }
}

impl<'de> Deserialize<'de> for MultiQueue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MultiQueueVisitor;

        impl<'de> de::Visitor<'de> for MultiQueueVisitor {
            type Value = MultiQueue;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a bool or a queue count")
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> std::result::Result<MultiQueue, E> {
                Ok(MultiQueue(if value { 2 } else { 1 }))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<MultiQueue, E> {
                let count =
                    u16::try_from(value).map_err(|_| E::custom("queue count out of range"))?;
                Ok(MultiQueue(count.max(1)))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<MultiQueue, E> {
                if value < 0 {
                    return Err(E::custom("queue count must not be negative"));
                }
                self.visit_u64(value as u64)
            }
        }

        deserializer.deserialize_any(MultiQueueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shim_config() -> &'static str {
        // The exact shape the embedding application writes.
        "tunnel:
  name: tun0
  mtu: 8500
  multi-queue: true
  ipv4: 26.26.26.1
socks5:
  port: 10808
  address: 127.0.0.1
  udp: 'udp'
misc:
  log-level: error
"
    }

    #[test]
    fn parses_shim_shaped_config() {
        let config = Config::from_yaml(shim_config()).unwrap();
        assert_eq!(config.tunnel.name, "tun0");
        assert_eq!(config.tunnel.mtu, 8500);
        assert_eq!(config.tunnel.multi_queue.queues(), 2);
        assert_eq!(config.tunnel.ipv4.ip(), "26.26.26.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(config.socks5.server_addr(), "127.0.0.1:10808".parse().unwrap());
        assert_eq!(config.socks5.udp, UdpMode::Udp);
        assert_eq!(config.misc.log_level, LogLevel::Error);
    }

    #[test]
    fn ipv4_accepts_prefix_notation() {
        let config = Config::from_yaml(
            "tunnel:\n  mtu: 1500\n  ipv4: 10.0.0.2/24\nsocks5:\n  port: 1080\n  address: 127.0.0.1\n",
        )
        .unwrap();
        assert_eq!(config.tunnel.ipv4.prefix(), 24);
        assert_eq!(config.tunnel.name, "tun0");
    }

    #[test]
    fn rejects_zero_port() {
        let err = Config::from_yaml(
            "tunnel:\n  mtu: 1500\n  ipv4: 10.0.0.2\nsocks5:\n  port: 0\n  address: 127.0.0.1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroPort));
    }

    #[test]
    fn rejects_zero_mtu() {
        let err = Config::from_yaml(
            "tunnel:\n  mtu: 0\n  ipv4: 10.0.0.2\nsocks5:\n  port: 1080\n  address: 127.0.0.1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroMtu));
    }

    #[test]
    fn rejects_malformed_address() {
        let err = Config::from_yaml(
            "tunnel:\n  mtu: 1500\n  ipv4: not-an-address\nsocks5:\n  port: 1080\n  address: 127.0.0.1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn log_level_mapping_defaults_to_error() {
        assert_eq!(LogLevel::from("none"), LogLevel::Error);
        assert_eq!(LogLevel::from(""), LogLevel::Error);
        assert_eq!(LogLevel::from("verbose"), LogLevel::Error);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);

        // Absent misc section entirely.
        let config = Config::from_yaml(
            "tunnel:\n  mtu: 1500\n  ipv4: 10.0.0.2\nsocks5:\n  port: 1080\n  address: 127.0.0.1\n",
        )
        .unwrap();
        assert_eq!(config.misc.log_level, LogLevel::Error);
    }

    #[test]
    fn misc_accepts_log_file() {
        let config = Config::from_yaml(
            "tunnel:\n  mtu: 1500\n  ipv4: 10.0.0.2\nsocks5:\n  port: 1080\n  address: 127.0.0.1\nmisc:\n  log-level: debug\n  log-file: /tmp/tunsocks.log\n",
        )
        .unwrap();
        assert_eq!(config.misc.log_level, LogLevel::Debug);
        assert_eq!(
            config.misc.log_file.as_deref(),
            Some(std::path::Path::new("/tmp/tunsocks.log"))
        );
    }

    #[test]
    fn multi_queue_accepts_bool_and_count() {
        let parse = |v: &str| {
            Config::from_yaml(&format!(
                "tunnel:\n  mtu: 1500\n  multi-queue: {v}\n  ipv4: 10.0.0.2\nsocks5:\n  port: 1080\n  address: 127.0.0.1\n",
            ))
            .unwrap()
            .tunnel
            .multi_queue
            .queues()
        };
        assert_eq!(parse("false"), 1);
        assert_eq!(parse("true"), 2);
        assert_eq!(parse("4"), 4);
        assert_eq!(parse("0"), 1);
    }
}
