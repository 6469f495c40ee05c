//! Server configuration, users, and permission resolution.
//!
//! Per-user permissions (host prefixes, TCP ranges, speed, connection
//! quota) default to the globals and are resolved once at startup, so the
//! handshake path never consults the global config.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use portico_proto::{DEFAULT_MAX_HANDSHAKE_OPTIONS, MAX_ID_SIZE, MAX_SECRET_SIZE, MIN_ID_SIZE, MIN_SECRET_SIZE};

use crate::ports::{PortRange, PortRangeError, PortsManager};

pub(crate) mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Main listener, serving both tunnel and proxied connections.
    pub addr: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// When set, one-directional traffic does not refresh task deadlines.
    pub timeout_on_unidirectional_traffic: bool,
    /// Bytes per second a client may transfer, per direction. 0 disables.
    pub speed: u32,
    /// Max tunnel connections per client id.
    pub connections: u32,
    /// Failed handshakes per IP before further attempts are dropped.
    pub reconnect_times: u32,
    /// How long a blocked IP stays blocked. 0 blocks forever.
    #[serde(with = "duration_secs")]
    pub reconnect_duration: Duration,
    pub host: HostConfig,
    pub tcp_ranges: Vec<TcpRangeConfig>,
    pub max_handshake_options: u16,
    /// Authenticate unknown ids on first use instead of rejecting them.
    pub allow_any_client: bool,
    pub users: HashMap<String, UserConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_owned(),
            timeout: Duration::from_secs(90),
            timeout_on_unidirectional_traffic: false,
            speed: 0,
            connections: 10,
            reconnect_times: 3,
            reconnect_duration: Duration::from_secs(300),
            host: HostConfig::default(),
            tcp_ranges: Vec::new(),
            max_handshake_options: DEFAULT_MAX_HANDSHAKE_OPTIONS,
            allow_any_client: false,
            users: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Host prefixes one client may claim. 0 means unlimited.
    pub number: u32,
    /// Allow-list; a requested prefix must match one when non-empty.
    pub regex: Vec<String>,
    /// Prefix every requested host with `id-`.
    pub with_id: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpRangeConfig {
    /// `"min-max"`, a single port, or `"0"` for the whole space.
    pub range: String,
    /// Leases allowed out of this range.
    pub number: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub secret: String,
    /// Private TCP ranges; empty shares the global set.
    pub tcp_ranges: Vec<TcpRangeConfig>,
    /// 0 inherits the global speed limit.
    pub speed: u32,
    /// 0 inherits the global connection quota.
    pub connections: u32,
    pub host: Option<HostConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid id length: '{0}'")]
    InvalidIdLength(String),

    #[error("invalid secret length for id '{0}'")]
    InvalidSecretLength(String),

    #[error(transparent)]
    PortRange(#[from] PortRangeError),

    #[error("tcp port {0} of user '{1}' overlaps the global ranges")]
    PortOverlap(u16, String),

    #[error("invalid host regex '{0}'")]
    InvalidHostRegex(String),
}

/// Resolved host permissions with compiled regexes.
#[derive(Debug, Clone, Default)]
pub struct HostPermissions {
    pub number: u32,
    pub regex: Arc<Vec<Regex>>,
    pub with_id: bool,
}

impl HostPermissions {
    fn compile(config: &HostConfig) -> Result<Self, ConfigError> {
        let mut compiled = Vec::with_capacity(config.regex.len());
        for pattern in &config.regex {
            compiled.push(
                Regex::new(pattern).map_err(|_| ConfigError::InvalidHostRegex(pattern.clone()))?,
            );
        }
        Ok(Self {
            number: config.number,
            regex: Arc::new(compiled),
            with_id: config.with_id,
        })
    }

    /// Empty allow-list admits everything.
    pub fn allows(&self, prefix: &str) -> bool {
        self.regex.is_empty() || self.regex.iter().any(|r| r.is_match(prefix))
    }
}

/// One authenticated client's permissions, copied out of config at startup
/// (or synthesized for allow-any-client mode).
#[derive(Clone)]
pub struct User {
    pub secret: String,
    pub speed: u32,
    pub connections: u32,
    pub host: HostPermissions,
    pub ports: Arc<PortsManager>,
    pub temp: bool,
}

#[derive(Debug, Error)]
#[error("invalid user")]
pub struct InvalidUser;

/// The id -> permissions table behind the `(id, secret)` authentication
/// collaborator.
pub struct Users {
    map: DashMap<String, User>,
    defaults: UserDefaults,
}

struct UserDefaults {
    speed: u32,
    connections: u32,
    host: HostPermissions,
    ports: Arc<PortsManager>,
}

fn parse_ranges(configs: &[TcpRangeConfig]) -> Result<Vec<(PortRange, u16)>, ConfigError> {
    configs
        .iter()
        .map(|c| Ok((PortRange::parse(&c.range)?, c.number)))
        .collect()
}

impl Users {
    /// Build the user table: validate ids/secrets, assemble the global and
    /// per-user port managers, compile host regexes.
    pub fn resolve(config: &ServerConfig) -> Result<Self, ConfigError> {
        let global_ranges = parse_ranges(&config.tcp_ranges)?;
        let global_ports = Arc::new(PortsManager::new(&global_ranges));
        let global_host = HostPermissions::compile(&config.host)?;

        let map = DashMap::new();
        for (id, uc) in &config.users {
            if id.len() < MIN_ID_SIZE || id.len() > MAX_ID_SIZE {
                return Err(ConfigError::InvalidIdLength(id.clone()));
            }
            if uc.secret.len() < MIN_SECRET_SIZE || uc.secret.len() > MAX_SECRET_SIZE {
                return Err(ConfigError::InvalidSecretLength(id.clone()));
            }

            let ports = if uc.tcp_ranges.is_empty() {
                Arc::clone(&global_ports)
            } else {
                let ranges = parse_ranges(&uc.tcp_ranges)?;
                for (range, _) in &ranges {
                    for (global, _) in &global_ranges {
                        let lo = range.min.max(global.min);
                        let hi = range.max.min(global.max);
                        if lo <= hi {
                            return Err(ConfigError::PortOverlap(lo, id.clone()));
                        }
                    }
                }
                Arc::new(PortsManager::new(&ranges))
            };

            let host = match &uc.host {
                Some(host) => HostPermissions::compile(host)?,
                None => global_host.clone(),
            };

            map.insert(
                id.clone(),
                User {
                    secret: uc.secret.clone(),
                    speed: if uc.speed > 0 { uc.speed } else { config.speed },
                    connections: if uc.connections > 0 {
                        uc.connections
                    } else {
                        config.connections
                    },
                    host,
                    ports,
                    temp: false,
                },
            );
        }

        Ok(Self {
            map,
            defaults: UserDefaults {
                speed: config.speed,
                connections: config.connections,
                host: global_host,
                ports: global_ports,
            },
        })
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// `(id, secret) -> permissions`.
    pub fn auth(&self, id: &str, secret: &str) -> Result<User, InvalidUser> {
        if id.is_empty() || secret.is_empty() {
            return Err(InvalidUser);
        }
        let user = self.map.get(id).ok_or(InvalidUser)?;
        if user.secret != secret {
            return Err(InvalidUser);
        }
        Ok(user.clone())
    }

    /// Allow-any-client mode: the first secret seen for an id claims it.
    pub fn auth_or_create(&self, id: &str, secret: &str) -> Result<User, InvalidUser> {
        if id.is_empty() || secret.is_empty() {
            return Err(InvalidUser);
        }
        let user = self
            .map
            .entry(id.to_owned())
            .or_insert_with(|| User {
                secret: secret.to_owned(),
                speed: self.defaults.speed,
                connections: self.defaults.connections,
                host: self.defaults.host.clone(),
                ports: Arc::clone(&self.defaults.ports),
                temp: true,
            })
            .clone();
        if user.secret != secret {
            return Err(InvalidUser);
        }
        Ok(user)
    }

    /// Drop a temp user created by [`Users::auth_or_create`].
    pub fn remove_temp(&self, id: &str) {
        self.map.remove_if(id, |_, user| user.temp);
    }
}
