//! # Configuration
//!
//! The communicators consume configuration as `section/key` entries, the
//! shape the transport service's configuration system hands over. Parsing a
//! full configuration format is a collaborator's job; this module keeps an
//! in-memory map with typed accessors, a loader for the simple
//! `[section]` / `KEY = value` files used in testing, and typed views for
//! each subsystem.
//!
//! Recognized keys (section → key):
//!
//! - `transport-unix/UNIXPATH` — filesystem path to bind/connect
//! - `transport-unix/SNDBUF` — initial socket send-buffer size
//! - `testing/USE_ABSTRACT_SOCKETS` — yes/no, Linux abstract namespace
//! - `<section>/MAX_QUEUE_LENGTH` — soft cap for the outbound service MQ
//! - `<section>/MAX_CONNECTIONS` — cap on concurrent HTTP request pairs
//! - `<section>/PROXY`, `PROXY_USERNAME`, `PROXY_PASSWORD`, `PROXY_TYPE`,
//!   `PROXY_HTTP_TUNNELING`
//! - `<section>/EMULATE_XHR` — yes/no
//! - `<section>/BINDTO`, `BINDTO6` — HTTP bind interfaces
//! - `<section>/INBOUND_LIMIT` — inbound bytes/sec throttle (unset: none)
//! - `nat/DISABLEV6` — suppress IPv6 sockets

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::defaults;

/// Configuration errors, all startup-fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration {section}/{key}")]
    Missing { section: String, key: String },

    #[error("configuration {section}/{key} has invalid value {value:?}")]
    Invalid {
        section: String,
        key: String,
        value: String,
    },

    #[error("cannot read configuration file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("malformed configuration line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

/// In-memory `section/key → value` map.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<(String, String), String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a minimal `[section]` / `KEY = value` file.
    ///
    /// Blank lines and `#` comments are skipped. This is a stand-in for the
    /// external configuration collaborator, not a full format.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::new();
        let mut section = String::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line: lineno + 1,
                    text: raw.to_string(),
                });
            };
            config.set(&section, key.trim(), value.trim());
        }
        Ok(config)
    }

    /// Insert or overwrite one entry.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.entries.insert(
            (section.to_ascii_lowercase(), key.to_ascii_uppercase()),
            value.to_string(),
        );
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.entries
            .get(&(section.to_ascii_lowercase(), key.to_ascii_uppercase()))
            .map(String::as_str)
    }

    /// A required string value.
    pub fn require(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
        self.get(section, key).ok_or_else(|| ConfigError::Missing {
            section: section.to_string(),
            key: key.to_string(),
        })
    }

    /// A `YES`/`NO` flag (case-insensitive); `default` when unset.
    pub fn get_yesno(&self, section: &str, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("yes") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("no") => Ok(false),
            Some(v) => Err(ConfigError::Invalid {
                section: section.to_string(),
                key: key.to_string(),
                value: v.to_string(),
            }),
        }
    }

    /// A non-negative number; `default` when unset.
    pub fn get_number(&self, section: &str, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                section: section.to_string(),
                key: key.to_string(),
                value: v.to_string(),
            }),
        }
    }
}

/// Proxy protocol selection for the HTTP communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Socks4,
    Socks5,
    Socks4a,
    Socks5Hostname,
}

impl ProxyType {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "HTTP" => Some(Self::Http),
            "SOCKS4" => Some(Self::Socks4),
            "SOCKS5" => Some(Self::Socks5),
            "SOCKS4A" => Some(Self::Socks4a),
            "SOCKS5_HOSTNAME" => Some(Self::Socks5Hostname),
            _ => None,
        }
    }

    /// URL scheme understood by the HTTP client.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Socks4 => "socks4",
            Self::Socks4a => "socks4a",
            Self::Socks5 => "socks5",
            Self::Socks5Hostname => "socks5h",
        }
    }
}

/// Proxy settings, assembled from the `PROXY*` keys of a section.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub proxy_type: ProxyType,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Accepted for compatibility; the HTTP client decides tunnelling
    /// per target scheme on its own.
    pub http_tunneling: bool,
}

impl ProxyConfig {
    /// The proxy URL handed to the HTTP client.
    pub fn url(&self) -> String {
        if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("{}://{}", self.proxy_type.scheme(), self.host)
        }
    }
}

/// Typed view for the UNIX communicator.
#[derive(Debug, Clone)]
pub struct UnixConfig {
    pub socket_path: PathBuf,
    pub use_abstract: bool,
    pub max_queue_length: usize,
    /// Initial SO_SNDBUF; `None` keeps the kernel default. The send path
    /// still grows the buffer on demand when a frame exceeds it.
    pub sndbuf: Option<usize>,
}

impl UnixConfig {
    pub const SECTION: &'static str = "transport-unix";

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let socket_path = PathBuf::from(config.require(Self::SECTION, "UNIXPATH")?);
        let use_abstract = config.get_yesno("testing", "USE_ABSTRACT_SOCKETS", false)?;
        let max_queue_length =
            config.get_number(Self::SECTION, "MAX_QUEUE_LENGTH", defaults::MAX_QUEUE_LENGTH as u64)?
                as usize;
        let sndbuf = match config.get(Self::SECTION, "SNDBUF") {
            None => None,
            Some(_) => Some(config.get_number(Self::SECTION, "SNDBUF", 0)? as usize),
        };
        Ok(Self {
            socket_path,
            use_abstract,
            max_queue_length,
            sndbuf,
        })
    }
}

/// Typed view for the HTTP/HTTPS communicator.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub https: bool,
    pub max_connections: usize,
    pub max_queue_length: usize,
    pub emulate_xhr: bool,
    pub bind_to: Option<String>,
    pub bind_to6: Option<String>,
    pub disable_v6: bool,
    pub proxy: Option<ProxyConfig>,
    /// Inbound throttle in bytes/sec; `None` disables throttling.
    pub inbound_limit: Option<u64>,
}

impl HttpConfig {
    pub fn section(https: bool) -> &'static str {
        if https {
            "transport-https"
        } else {
            "transport-http"
        }
    }

    pub fn from_config(config: &Config, https: bool) -> Result<Self, ConfigError> {
        let section = Self::section(https);
        let proxy = match config.get(section, "PROXY") {
            None => None,
            Some(host) => {
                let type_str = config.get(section, "PROXY_TYPE").unwrap_or("HTTP");
                let proxy_type =
                    ProxyType::parse(type_str).ok_or_else(|| ConfigError::Invalid {
                        section: section.to_string(),
                        key: "PROXY_TYPE".to_string(),
                        value: type_str.to_string(),
                    })?;
                Some(ProxyConfig {
                    host: host.to_string(),
                    proxy_type,
                    username: config.get(section, "PROXY_USERNAME").map(str::to_string),
                    password: config.get(section, "PROXY_PASSWORD").map(str::to_string),
                    http_tunneling: config.get_yesno(section, "PROXY_HTTP_TUNNELING", false)?,
                })
            }
        };
        let inbound_limit = match config.get(section, "INBOUND_LIMIT") {
            None => None,
            Some(_) => Some(config.get_number(section, "INBOUND_LIMIT", 0)?),
        };
        Ok(Self {
            https,
            max_connections: config
                .get_number(section, "MAX_CONNECTIONS", defaults::MAX_CONNECTIONS as u64)?
                as usize,
            max_queue_length: config
                .get_number(section, "MAX_QUEUE_LENGTH", defaults::MAX_QUEUE_LENGTH as u64)?
                as usize,
            emulate_xhr: config.get_yesno(section, "EMULATE_XHR", false)?,
            bind_to: config.get(section, "BINDTO").map(str::to_string),
            bind_to6: config.get(section, "BINDTO6").map(str::to_string),
            disable_v6: config.get_yesno("nat", "DISABLEV6", false)?,
            proxy,
            inbound_limit,
        })
    }
}
