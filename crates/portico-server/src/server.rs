//! The relay server: listeners, global routing tables, lifecycle.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use portico_connection::Connection;

use crate::aggregate::ClientAggregate;
use crate::config::{ConfigError, InvalidUser, ServerConfig, User, Users};
use crate::conn::handle_connection;
use crate::http::prefix_from_host;
use crate::throttle::ReconnectThrottle;

const SHUTDOWN_POLL: Duration = Duration::from_secs(3);

/// Where a host prefix routes: the owning aggregate and which of its
/// services the prefix names.
#[derive(Clone)]
pub(crate) struct RouteTarget {
    pub aggregate: Arc<ClientAggregate>,
    pub service_index: u16,
}

pub(crate) enum Claim {
    Claimed,
    Ours,
    Conflict,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub accepted: AtomicU64,
    pub served: AtomicU64,
    pub failed: AtomicU64,
    pub tunneling: AtomicU64,
}

/// Connection statistics; `accepted == served + failed + tunneling` once
/// everything in flight has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub served: u64,
    pub failed: u64,
    pub tunneling: u64,
}

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) users: Users,
    pub(crate) counters: Counters,
    pub(crate) throttle: Arc<ReconnectThrottle>,
    id_to_client: DashMap<String, Arc<ClientAggregate>>,
    host_prefixes: DashMap<String, RouteTarget>,
    tls_host_prefixes: DashMap<String, RouteTarget>,
    closing: AtomicBool,
    cancel: CancellationToken,
}

impl ServerInner {
    pub(crate) fn new(config: ServerConfig, users: Users) -> Arc<Self> {
        let throttle =
            ReconnectThrottle::new(config.reconnect_times, config.reconnect_duration);
        Arc::new(Self {
            config,
            users,
            counters: Counters::default(),
            throttle,
            id_to_client: DashMap::new(),
            host_prefixes: DashMap::new(),
            tls_host_prefixes: DashMap::new(),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// The `(id, secret) -> permissions` collaborator. With no users
    /// configured (or allow-any-client set) the first secret seen for an id
    /// claims it.
    pub(crate) fn authenticate(&self, id: &str, secret: &str) -> Result<User, InvalidUser> {
        if self.config.allow_any_client || self.users.is_empty() {
            self.users.auth_or_create(id, secret)
        } else {
            self.users.auth(id, secret)
        }
    }

    /// At most one aggregate per id, even under concurrent handshakes.
    pub(crate) fn get_or_create_aggregate(
        self: &Arc<Self>,
        id: &str,
        user: &User,
    ) -> Arc<ClientAggregate> {
        match self.id_to_client.entry(id.to_owned()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let aggregate = ClientAggregate::new(id, user, Arc::clone(self));
                entry.insert(Arc::clone(&aggregate));
                aggregate
            }
        }
    }

    pub(crate) fn remove_aggregate(&self, aggregate: &Arc<ClientAggregate>, temp_user: bool) {
        self.id_to_client
            .remove_if(&aggregate.id, |_, current| Arc::ptr_eq(current, aggregate));
        if temp_user {
            self.users.remove_temp(&aggregate.id);
        }
    }

    pub(crate) fn claim_prefix(
        &self,
        prefix: &str,
        tls: bool,
        aggregate: &Arc<ClientAggregate>,
        service_index: u16,
    ) -> Claim {
        let map = if tls {
            &self.tls_host_prefixes
        } else {
            &self.host_prefixes
        };
        match map.entry(prefix.to_owned()) {
            Entry::Occupied(mut entry) => {
                if Arc::ptr_eq(&entry.get().aggregate, aggregate) {
                    entry.get_mut().service_index = service_index;
                    Claim::Ours
                } else {
                    Claim::Conflict
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(RouteTarget {
                    aggregate: Arc::clone(aggregate),
                    service_index,
                });
                Claim::Claimed
            }
        }
    }

    pub(crate) fn remove_prefix_if_owned(
        &self,
        prefix: &str,
        tls: bool,
        aggregate: &Arc<ClientAggregate>,
    ) {
        let map = if tls {
            &self.tls_host_prefixes
        } else {
            &self.host_prefixes
        };
        map.remove_if(prefix, |_, target| {
            Arc::ptr_eq(&target.aggregate, aggregate)
        });
    }

    pub(crate) fn remove_prefixes_of(&self, aggregate: &Arc<ClientAggregate>) {
        self.host_prefixes
            .retain(|_, target| !Arc::ptr_eq(&target.aggregate, aggregate));
        self.tls_host_prefixes
            .retain(|_, target| !Arc::ptr_eq(&target.aggregate, aggregate));
    }

    pub(crate) fn lookup_prefix(&self, prefix: &str, tls: bool) -> Option<RouteTarget> {
        let map = if tls {
            &self.tls_host_prefixes
        } else {
            &self.host_prefixes
        };
        map.get(prefix).map(|target| target.clone())
    }
}

/// The relay server. One listener serves tunnel handshakes and plain
/// proxied traffic, told apart by the protocol's magic prefix; additional
/// listeners appear as clients lease TCP ports.
pub struct Server {
    inner: Arc<ServerInner>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let users = Users::resolve(&config)?;
        Ok(Self {
            inner: ServerInner::new(config, users),
            local_addr: StdMutex::new(None),
        })
    }

    /// Bind the main listener and start accepting. Returns once listening.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.inner.config.addr).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(addr);
        info!(%addr, "listening");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(accept_loop(listener, inner));
        Ok(())
    }

    /// Actual bound address, useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.inner.counters;
        ServerStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            served: c.served.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            tunneling: c.tunneling.load(Ordering::Relaxed),
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.id_to_client.len()
    }

    /// Entry point for the TLS/SNI collaborator: route a stream whose
    /// server name was already extracted elsewhere. The stream is consumed;
    /// returns false when no client owns the name.
    pub async fn route_tls(&self, server_name: &str, stream: TcpStream) -> bool {
        self.inner
            .counters
            .accepted
            .fetch_add(1, Ordering::Relaxed);
        let Some(prefix) = prefix_from_host(server_name) else {
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let Some(target) = self.inner.lookup_prefix(prefix, true) else {
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        stream.set_nodelay(true).ok();
        let (conn, reader) = Connection::split(Box::new(stream), self.inner.config.timeout);
        let served = target
            .aggregate
            .process(Arc::clone(&conn), reader, target.service_index)
            .await
            .is_ok();
        conn.close().await;
        if served {
            self.inner.counters.served.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        served
    }

    /// Graceful shutdown: stop accepting, ask every client to drain, wait
    /// for the counters to settle, then force-close stragglers.
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        loop {
            let stats = self.stats();
            if stats.accepted == stats.served + stats.failed + stats.tunneling {
                break;
            }

            let aggregates: Vec<_> = self
                .inner
                .id_to_client
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            if aggregates.is_empty() {
                break;
            }
            for aggregate in aggregates {
                aggregate.shutdown().await;
            }
            info!(
                accepted = stats.accepted,
                served = stats.served,
                failed = stats.failed,
                tunneling = stats.tunneling,
                "server shutting down"
            );
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        self.close_all().await;
        info!("server stopped");
    }

    /// Abrupt shutdown.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        self.close_all().await;
        info!("server stopped");
    }

    async fn close_all(&self) {
        let aggregates: Vec<_> = self
            .inner
            .id_to_client
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for aggregate in aggregates {
            aggregate.close().await;
        }
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<ServerInner>) {
    let cancel = inner.cancel.clone();
    let mut retry_delay = Duration::ZERO;
    info!("accept loop started");
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        if inner.is_closing() {
            break;
        }
        match accepted {
            Ok((stream, peer)) => {
                retry_delay = Duration::ZERO;
                let inner = Arc::clone(&inner);
                tokio::spawn(handle_connection(inner, stream, peer.ip()));
            }
            Err(err) => {
                // Transient resource exhaustion: back off and keep serving.
                retry_delay = if retry_delay.is_zero() {
                    Duration::from_millis(5)
                } else {
                    (retry_delay * 2).min(Duration::from_secs(1))
                };
                error!(%err, delay = ?retry_delay, "accept error");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
    info!("accept loop ended");
}
