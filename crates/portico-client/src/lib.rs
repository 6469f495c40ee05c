//! Portico client agent.
//!
//! Keeps a pool of persistent outbound tunnel connections to a portico
//! server and serves the proxied tasks the server multiplexes over them,
//! dialing the real local services and piping bytes back under the same
//! task ids.

pub mod client;
pub mod config;
mod conn;
pub mod idle;
pub mod task;

pub use client::{Client, ClientError};
pub use config::{ClientConfig, ConfigError, Service, ServiceConfig};
pub use idle::{IdleManager, Status};
pub use task::{HostRewriter, HttpTask};
