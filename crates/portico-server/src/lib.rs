//! Portico relay server.
//!
//! Accepts persistent tunnel connections from clients and multiplexes
//! inbound public traffic back over them: HTTP requests are routed by host
//! prefix, TCP connections by leased public ports. The tunnel protocol and
//! the generic stream plumbing live in `portico-proto` and
//! `portico-connection`.

mod aggregate;
pub mod config;
mod conn;
pub mod http;
pub mod ports;
pub mod server;
pub mod speed;
pub mod throttle;

pub use config::{
    ConfigError, HostConfig, ServerConfig, TcpRangeConfig, UserConfig, Users,
};
pub use ports::{LeaseError, PortRange, PortsManager};
pub use server::{Server, ServerError, ServerStats};
