//! Client configuration and declared services.
//!
//! A service is one local endpoint the client exposes through the relay:
//! `http://` / `https://` endpoints are routed by host prefix, `tcp://`
//! endpoints by a leased public port. Service order matters - the position
//! in the list is the service index used on the wire.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use portico_proto::{ServiceOption, MAX_HOST_PREFIX_SIZE, MAX_ID_SIZE, MIN_ID_SIZE};

/// Upper bound on tunnel connections a client keeps to one server.
pub const MAX_REMOTE_CONNECTIONS: u32 = 10;

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
pub struct ClientConfig {
    /// Client id, also the default host prefix.
    pub id: String,
    pub secret: String,
    /// Remote endpoints, `tcp://host:port` or `tls://host:port`.
    pub remotes: Vec<String>,
    /// Tunnel connections to keep, clamped to `1..=10`.
    pub remote_connections: u32,
    /// Warm connections kept idle, clamped to `1..=remote_connections`.
    pub remote_idle_connections: u32,
    #[serde(with = "duration_secs")]
    pub remote_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
    /// Extra PEM root certificate for `tls://` remotes.
    pub remote_cert: Option<PathBuf>,
    /// Skip certificate verification for `tls://` remotes. Testing only.
    pub remote_cert_insecure: bool,
    pub services: Vec<ServiceConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            secret: String::new(),
            remotes: Vec::new(),
            remote_connections: 1,
            remote_idle_connections: 1,
            remote_timeout: Duration::from_secs(45),
            reconnect_delay: Duration::from_secs(5),
            remote_cert: None,
            remote_cert_insecure: false,
            services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Local endpoint: `http://host[:port]`, `https://host[:port]`, or
    /// `tcp://host:port`.
    pub local: String,
    /// Host prefix for http/https services. The first such service without
    /// one uses the client id.
    pub host_prefix: Option<String>,
    /// Requested public port for tcp services.
    pub remote_tcp_port: Option<u16>,
    /// Let the server pick any port when the requested one is taken.
    /// Defaults to true exactly when no specific port is requested.
    pub remote_tcp_random: Option<bool>,
    #[serde(with = "duration_secs")]
    pub local_timeout: Duration,
    /// Rewrite the forwarded `Host:` header to the local authority.
    pub use_local_as_http_host: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            local: String::new(),
            host_prefix: None,
            remote_tcp_port: None,
            remote_tcp_random: None,
            local_timeout: Duration::from_secs(120),
            use_local_as_http_host: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalScheme {
    Http,
    Https,
    Tcp,
}

/// A validated, defaulted service ready to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub scheme: LocalScheme,
    /// `host:port` authority of the local endpoint.
    pub local_addr: String,
    /// Set for http/https services.
    pub host_prefix: Option<String>,
    pub remote_tcp_port: u16,
    pub remote_tcp_random: bool,
    pub local_timeout: Duration,
    pub use_local_as_http_host: bool,
}

impl Service {
    pub fn to_option(&self) -> ServiceOption {
        match self.scheme {
            LocalScheme::Tcp => ServiceOption::OpenTcpPort {
                random: self.remote_tcp_random,
                port: self.remote_tcp_port,
            },
            LocalScheme::Http => ServiceOption::OpenHost {
                prefix: self.host_prefix.clone().unwrap_or_default(),
                tls: false,
            },
            LocalScheme::Https => ServiceOption::OpenHost {
                prefix: self.host_prefix.clone().unwrap_or_default(),
                tls: true,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("client id '{0}' is invalid (length must be 1..=200)")]
    InvalidId(String),

    #[error("client secret is invalid (length must be 1..=200)")]
    InvalidSecret,

    #[error("no remote is configured")]
    NoRemote,

    #[error("no service is configured")]
    NoService,

    #[error("local url '{0}' must begin with http://, https:// or tcp://")]
    InvalidLocalScheme(String),

    #[error("local url '{0}' must contain a port")]
    MissingLocalPort(String),

    #[error("tcp service '{0}' needs remote_tcp_port or remote_tcp_random")]
    MissingRemotePort(String),

    #[error("host prefix '{0}' is invalid (length must be 1..=200)")]
    InvalidHostPrefix(String),

    #[error("multiple http services need explicit host prefixes")]
    AmbiguousHostPrefix,

    #[error("duplicated host prefix: '{0}'")]
    DuplicateHostPrefix(String),
}

/// Validate and default the declared services. Index in the returned vector
/// is the wire service index.
pub fn parse_services(config: &ClientConfig) -> Result<Vec<Service>, ConfigError> {
    if config.services.is_empty() {
        return Err(ConfigError::NoService);
    }

    let mut used_id_as_prefix = false;
    let mut services = Vec::with_capacity(config.services.len());
    for sc in &config.services {
        let (scheme, rest) = match sc.local.split_once("://") {
            Some(("http", rest)) => (LocalScheme::Http, rest),
            Some(("https", rest)) => (LocalScheme::Https, rest),
            Some(("tcp", rest)) => (LocalScheme::Tcp, rest),
            _ => return Err(ConfigError::InvalidLocalScheme(sc.local.clone())),
        };
        if rest.is_empty() {
            return Err(ConfigError::InvalidLocalScheme(sc.local.clone()));
        }

        let local_addr = match (scheme, rest.contains(':')) {
            (_, true) => rest.to_owned(),
            (LocalScheme::Http, false) => format!("{rest}:80"),
            (LocalScheme::Https, false) => format!("{rest}:443"),
            (LocalScheme::Tcp, false) => {
                return Err(ConfigError::MissingLocalPort(sc.local.clone()))
            }
        };

        let remote_tcp_port = sc.remote_tcp_port.unwrap_or(0);
        let remote_tcp_random = sc
            .remote_tcp_random
            .unwrap_or(scheme == LocalScheme::Tcp && remote_tcp_port == 0);

        let mut host_prefix = None;
        if scheme != LocalScheme::Tcp {
            let prefix = match &sc.host_prefix {
                Some(prefix) => prefix.clone(),
                None => {
                    if used_id_as_prefix {
                        return Err(ConfigError::AmbiguousHostPrefix);
                    }
                    used_id_as_prefix = true;
                    config.id.clone()
                }
            };
            if prefix.is_empty() || prefix.len() > MAX_HOST_PREFIX_SIZE {
                return Err(ConfigError::InvalidHostPrefix(prefix));
            }
            host_prefix = Some(prefix);
        } else if remote_tcp_port == 0 && !remote_tcp_random {
            return Err(ConfigError::MissingRemotePort(sc.local.clone()));
        }

        services.push(Service {
            scheme,
            local_addr,
            host_prefix,
            remote_tcp_port,
            remote_tcp_random,
            local_timeout: sc.local_timeout,
            use_local_as_http_host: sc.use_local_as_http_host,
        });
    }

    for i in 0..services.len() {
        for j in i + 1..services.len() {
            if let (Some(a), Some(b)) = (&services[i].host_prefix, &services[j].host_prefix) {
                if a == b {
                    return Err(ConfigError::DuplicateHostPrefix(a.clone()));
                }
            }
        }
    }

    Ok(services)
}

/// Validate id/secret and clamp the pool bounds in place.
pub fn validate(config: &mut ClientConfig) -> Result<(), ConfigError> {
    if config.id.len() < MIN_ID_SIZE || config.id.len() > MAX_ID_SIZE {
        return Err(ConfigError::InvalidId(config.id.clone()));
    }
    if config.secret.is_empty() || config.secret.len() > MAX_ID_SIZE {
        return Err(ConfigError::InvalidSecret);
    }
    if config.remotes.is_empty() {
        return Err(ConfigError::NoRemote);
    }
    config.remote_connections = config.remote_connections.clamp(1, MAX_REMOTE_CONNECTIONS);
    config.remote_idle_connections = config
        .remote_idle_connections
        .clamp(1, config.remote_connections);
    Ok(())
}

pub fn service_options(services: &[Service]) -> Vec<ServiceOption> {
    services.iter().map(Service::to_option).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ClientConfig {
        ClientConfig {
            id: "myid".into(),
            secret: "secret".into(),
            remotes: vec!["tcp://127.0.0.1:7000".into()],
            ..Default::default()
        }
    }

    #[test]
    fn http_service_defaults_prefix_to_id() {
        let mut config = base_config();
        config.services = vec![ServiceConfig {
            local: "http://127.0.0.1:3000".into(),
            ..Default::default()
        }];
        let services = parse_services(&config).unwrap();
        assert_eq!(services[0].host_prefix.as_deref(), Some("myid"));
        assert_eq!(services[0].local_addr, "127.0.0.1:3000");
    }

    #[test]
    fn second_default_prefix_is_ambiguous() {
        let mut config = base_config();
        config.services = vec![
            ServiceConfig {
                local: "http://127.0.0.1:3000".into(),
                ..Default::default()
            },
            ServiceConfig {
                local: "http://127.0.0.1:3001".into(),
                ..Default::default()
            },
        ];
        assert!(matches!(
            parse_services(&config),
            Err(ConfigError::AmbiguousHostPrefix)
        ));
    }

    #[test]
    fn tcp_random_defaults_follow_port() {
        let mut config = base_config();
        config.services = vec![ServiceConfig {
            local: "tcp://127.0.0.1:22".into(),
            ..Default::default()
        }];
        let services = parse_services(&config).unwrap();
        assert!(services[0].remote_tcp_random);

        config.services[0].remote_tcp_port = Some(2222);
        let services = parse_services(&config).unwrap();
        assert!(!services[0].remote_tcp_random);
        assert_eq!(services[0].remote_tcp_port, 2222);
    }

    #[test]
    fn tcp_without_port_or_random_is_rejected() {
        let mut config = base_config();
        config.services = vec![ServiceConfig {
            local: "tcp://127.0.0.1:22".into(),
            remote_tcp_random: Some(false),
            ..Default::default()
        }];
        assert!(matches!(
            parse_services(&config),
            Err(ConfigError::MissingRemotePort(_))
        ));
    }

    #[test]
    fn duplicate_prefixes_are_rejected() {
        let mut config = base_config();
        config.services = vec![
            ServiceConfig {
                local: "http://127.0.0.1:3000".into(),
                host_prefix: Some("app".into()),
                ..Default::default()
            },
            ServiceConfig {
                local: "https://127.0.0.1:3001".into(),
                host_prefix: Some("app".into()),
                ..Default::default()
            },
        ];
        assert!(matches!(
            parse_services(&config),
            Err(ConfigError::DuplicateHostPrefix(_))
        ));
    }

    #[test]
    fn validate_clamps_pool_bounds() {
        let mut config = base_config();
        config.remote_connections = 100;
        config.remote_idle_connections = 50;
        validate(&mut config).unwrap();
        assert_eq!(config.remote_connections, 10);
        assert_eq!(config.remote_idle_connections, 10);

        config.remote_connections = 0;
        config.remote_idle_connections = 0;
        validate(&mut config).unwrap();
        assert_eq!(config.remote_connections, 1);
        assert_eq!(config.remote_idle_connections, 1);
    }

    #[test]
    fn service_options_map_schemes() {
        let mut config = base_config();
        config.services = vec![
            ServiceConfig {
                local: "https://127.0.0.1:3001".into(),
                host_prefix: Some("api".into()),
                ..Default::default()
            },
            ServiceConfig {
                local: "tcp://127.0.0.1:22".into(),
                remote_tcp_port: Some(2222),
                ..Default::default()
            },
        ];
        let services = parse_services(&config).unwrap();
        let options = service_options(&services);
        assert_eq!(
            options[0],
            ServiceOption::OpenHost {
                prefix: "api".into(),
                tls: true
            }
        );
        assert_eq!(
            options[1],
            ServiceOption::OpenTcpPort {
                random: false,
                port: 2222
            }
        );
    }
}
