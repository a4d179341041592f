//! Configuration file model.
//!
//! ```toml
//! [[zone]]
//! name = "upstream_fair"
//! size = "64k"
//!
//! [[upstream]]
//! name = "api"
//! zone = "upstream_fair"
//!
//! [[upstream.backend]]
//! addr = "127.0.0.1:9001"
//! weight = 2
//! max_in_flight = 64
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::Path;
use std::str::FromStr;

/// Longest zone name accepted. Some platforms cap shared memory object names at 31 bytes
/// and the OS name carries a prefix.
pub const MAX_ZONE_NAME_LEN: usize = 23;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A size expression could not be parsed or is not positive
    #[error("invalid size \"{0}\"")]
    InvalidSize(String),
    /// Zone names are limited to ASCII alphanumerics, `_` and `-`
    #[error("invalid zone name \"{0}\"")]
    InvalidZoneName(String),
    /// Two zones share one name
    #[error("zone \"{0}\" is declared more than once")]
    DuplicateZone(String),
    /// Zone offsets are 32-bit, larger zones cannot be addressed
    #[error("zone \"{name}\" size {size} exceeds the addressable maximum")]
    ZoneTooLarge {
        /// Zone name
        name: String,
        /// Requested size in bytes
        size: u64,
    },
    /// Two upstreams share one name
    #[error("upstream \"{0}\" is declared more than once")]
    DuplicateUpstream(String),
    /// An upstream points at a zone that is not declared
    #[error("upstream \"{upstream}\" refers to unknown zone \"{zone}\"")]
    UnknownZone {
        /// Upstream name
        upstream: String,
        /// The missing zone
        zone: String,
    },
    /// An upstream without backends
    #[error("upstream \"{0}\" has no backends")]
    NoBackends(String),
    /// A backend with weight zero
    #[error("upstream \"{upstream}\" backend {addr} has zero weight")]
    ZeroWeight {
        /// Upstream name
        upstream: String,
        /// Backend address
        addr: SocketAddr,
    },
    /// The file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML for this model
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A positive byte count parsed from an expression such as `150`, `64k` or `1M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "SizeRepr")]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// The size in bytes.
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSize(s.to_string());

        let (digits, scale) = match s.as_bytes().last() {
            Some(b'k' | b'K') => (&s[..s.len() - 1], 1u64 << 10),
            Some(b'm' | b'M') => (&s[..s.len() - 1], 1 << 20),
            Some(b'g' | b'G') => (&s[..s.len() - 1], 1 << 30),
            Some(_) => (s, 1),
            None => return Err(invalid()),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        match value.checked_mul(scale) {
            Some(0) | None => Err(invalid()),
            Some(bytes) => Ok(ByteSize(bytes)),
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<SizeRepr> for ByteSize {
    type Error = ConfigError;

    fn try_from(repr: SizeRepr) -> Result<Self, Self::Error> {
        match repr {
            SizeRepr::Bytes(0) => Err(ConfigError::InvalidSize("0".to_string())),
            SizeRepr::Bytes(n) => Ok(ByteSize(n)),
            SizeRepr::Text(s) => s.parse(),
        }
    }
}

/// A shared memory zone declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    /// Logical zone name, unique within the configuration
    pub name: String,
    /// Zone size
    pub size: ByteSize,
    /// Payload written into the zone by its initializer
    #[serde(default)]
    pub seed: Option<String>,
}

impl ZoneConfig {
    /// Build a zone declaration without a seed payload.
    pub fn new(name: impl Into<String>, size: ByteSize) -> Self {
        Self {
            name: name.into(),
            size,
            seed: None,
        }
    }

    /// Check the name and size of this zone in isolation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name_ok = !self.name.is_empty()
            && self.name.len() <= MAX_ZONE_NAME_LEN
            && self
                .name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !name_ok {
            return Err(ConfigError::InvalidZoneName(self.name.clone()));
        }

        if self.size.bytes() > u64::from(u32::MAX) {
            return Err(ConfigError::ZoneTooLarge {
                name: self.name.clone(),
                size: self.size.bytes(),
            });
        }
        Ok(())
    }
}

/// A backend entry of an upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Backend address
    pub addr: SocketAddr,
    /// Relative weight
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Concurrency limit, unlimited when absent
    #[serde(default)]
    pub max_in_flight: Option<NonZeroU32>,
}

fn default_weight() -> u32 {
    1
}

/// A named group of backends whose statistics live in one zone.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Upstream name
    pub name: String,
    /// Zone holding the statistics of this upstream
    pub zone: String,
    /// Backends in order
    #[serde(rename = "backend", default)]
    pub backends: Vec<BackendConfig>,
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Declared zones
    #[serde(rename = "zone", default)]
    pub zones: Vec<ZoneConfig>,
    /// Declared upstreams
    #[serde(rename = "upstream", default)]
    pub upstreams: Vec<UpstreamConfig>,
}

impl Config {
    /// Parse and validate a configuration document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loaded configuration");
        Self::from_toml(&text)
    }

    /// Cross-check zones and upstreams.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut zones = HashSet::new();
        for zone in &self.zones {
            zone.validate()?;
            if !zones.insert(zone.name.as_str()) {
                return Err(ConfigError::DuplicateZone(zone.name.clone()));
            }
        }

        let mut upstreams = HashSet::new();
        for upstream in &self.upstreams {
            if !upstreams.insert(upstream.name.as_str()) {
                return Err(ConfigError::DuplicateUpstream(upstream.name.clone()));
            }
            if !zones.contains(upstream.zone.as_str()) {
                return Err(ConfigError::UnknownZone {
                    upstream: upstream.name.clone(),
                    zone: upstream.zone.clone(),
                });
            }
            if upstream.backends.is_empty() {
                return Err(ConfigError::NoBackends(upstream.name.clone()));
            }
            if let Some(b) = upstream.backends.iter().find(|b| b.weight == 0) {
                return Err(ConfigError::ZeroWeight {
                    upstream: upstream.name.clone(),
                    addr: b.addr,
                });
            }
        }
        Ok(())
    }
}
