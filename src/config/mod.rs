//! Typed configuration record (spec.md §3, §6.2).
//!
//! One fixed YAML shape deserialized with `serde`, unlike the teacher's
//! manual `yaml-rust` walk (which exists there to cope with dozens of
//! heterogeneous server/escaper kinds sharing one file — see DESIGN.md).

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

mod defaults;
use defaults::*;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("at least one of tcp, udp, or dns must be configured")]
    NoServerConfigured,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Socks5Config {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_udp_mode")]
    pub udp: UdpMode,
    #[serde(default)]
    pub pipeline: bool,
    #[serde(default, with = "mark_serde")]
    pub mark: u32,
    #[serde(rename = "udp-addr", default)]
    pub udp_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    Tcp,
    Udp,
}

fn default_udp_mode() -> UdpMode {
    UdpMode::Tcp
}

mod mark_serde {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(d: D) -> Result<u32, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum MarkValue {
            Num(u32),
            Str(String),
        }
        match MarkValue::deserialize(d)? {
            MarkValue::Num(n) => Ok(n),
            MarkValue::Str(s) => {
                let s = s.trim();
                if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    u32::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
                } else {
                    s.parse().map_err(serde::de::Error::custom)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UdpConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    pub address: String,
    pub port: u16,
    pub upstream: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiscConfig {
    #[serde(rename = "task-stack-size", default = "default_task_stack_size")]
    pub task_stack_size: usize,
    #[serde(
        rename = "udp-recv-buffer-size",
        default = "default_udp_recv_buffer_size"
    )]
    pub udp_recv_buffer_size: usize,
    #[serde(rename = "connect-timeout", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(
        rename = "read-write-timeout",
        default = "default_read_write_timeout_ms"
    )]
    pub read_write_timeout_ms: u64,
    #[serde(rename = "limit-nofile", default = "default_limit_nofile")]
    pub limit_nofile: u64,
    #[serde(rename = "pid-file", default)]
    pub pid_file: Option<String>,
    #[serde(rename = "log-file", default)]
    pub log_file: Option<String>,
    #[serde(rename = "log-level", default = "default_log_level")]
    pub log_level: LogLevel,
}

impl Default for MiscConfig {
    fn default() -> Self {
        MiscConfig {
            task_stack_size: default_task_stack_size(),
            udp_recv_buffer_size: default_udp_recv_buffer_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_write_timeout_ms: default_read_write_timeout_ms(),
            limit_nofile: default_limit_nofile(),
            pid_file: None,
            log_file: None,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

#[derive(Debug, Clone, Deserialize)]
struct MainConfig {
    #[serde(default = "default_workers")]
    workers: usize,
}

impl Default for MainConfig {
    fn default() -> Self {
        MainConfig {
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    main: MainConfig,
    pub socks5: Socks5Config,
    pub tcp: Option<TcpConfig>,
    pub udp: Option<UdpConfig>,
    pub dns: Option<DnsConfig>,
    #[serde(default)]
    pub misc: MiscConfig,
}

impl Config {
    pub fn workers(&self) -> usize {
        self.main.workers.max(1)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp.is_none() && self.udp.is_none() && self.dns.is_none() {
            return Err(ConfigError::NoServerConfigured);
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_tcp_only_config_parses_with_defaults() {
        let yaml = r#"
socks5:
  address: 127.0.0.1
  port: 1080
tcp:
  address: 0.0.0.0
  port: 1088
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.workers(), 1);
        assert_eq!(cfg.misc.connect_timeout_ms, 5000);
        assert_eq!(cfg.misc.read_write_timeout_ms, 60000);
        assert_eq!(cfg.misc.limit_nofile, 65535);
        assert_eq!(cfg.misc.log_level, LogLevel::Warn);
        assert_eq!(cfg.socks5.udp, UdpMode::Tcp);
        assert!(!cfg.socks5.pipeline);
    }

    #[test]
    fn no_server_configured_is_fatal() {
        let yaml = r#"
socks5:
  address: 127.0.0.1
  port: 1080
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoServerConfigured)));
    }

    #[test]
    fn hex_mark_is_parsed() {
        let yaml = r#"
socks5:
  address: 127.0.0.1
  port: 1080
  mark: "0xff"
tcp:
  address: 0.0.0.0
  port: 1088
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.socks5.mark, 0xff);
    }
}
