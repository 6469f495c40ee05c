//! Client agent orchestration.
//!
//! Owns the pool of tunnel connections: one connect loop per connection id,
//! each cycling through dial, handshake, read loop, and the idle-manager
//! rendezvous before reconnecting. Reconnection is infinite with a fixed
//! delay until shutdown.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use portico_connection::{Connection, DialError, Dialer, FrameReader, TlsOptions};
use portico_proto::handshake::{encode_options, HandshakeError};

use crate::config::{parse_services, service_options, validate, ClientConfig, Service};
use crate::conn::TunnelConn;
use crate::idle::{IdleManager, Status};

const RELOAD_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("timed out waiting for a ready tunnel")]
    ReadyTimeout,

    #[error("services reload timed out")]
    ReloadTimeout,

    #[error("services did not change")]
    ReloadUnchanged,

    #[error("client is closing")]
    Closing,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) idle_manager: IdleManager,
    services: RwLock<Arc<Vec<Service>>>,
    tunnels: RwLock<HashMap<u64, Arc<TunnelConn>>>,
    ready: Notify,
    closing: AtomicBool,
    /// Serializes dial+handshake so reconnecting loops come up one at a
    /// time.
    init_lock: tokio::sync::Mutex<()>,
    reload_pending: AtomicU32,
    reload_done: Notify,
}

impl ClientInner {
    pub(crate) fn current_services(&self) -> Arc<Vec<Service>> {
        self.services.read().unwrap().clone()
    }

    pub(crate) fn add_tunnel(&self, tunnel: &Arc<TunnelConn>) {
        self.tunnels
            .write()
            .unwrap()
            .insert(tunnel.conn_id, Arc::clone(tunnel));
        self.ready.notify_waiters();
    }

    pub(crate) fn remove_tunnel(&self, conn_id: u64, tunnel: &Arc<TunnelConn>) {
        let mut tunnels = self.tunnels.write().unwrap();
        if let Some(current) = tunnels.get(&conn_id) {
            if Arc::ptr_eq(current, tunnel) {
                tunnels.remove(&conn_id);
            }
        }
    }

    pub(crate) fn ack_reload(&self) {
        let decremented = self
            .reload_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if decremented {
            self.reload_done.notify_waiters();
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    async fn init_conn(
        self: &Arc<Self>,
        dialer: &Dialer,
        conn_id: u64,
    ) -> Result<(Arc<TunnelConn>, FrameReader), ClientError> {
        let stream = dialer.dial().await?;
        let (conn, reader) = Connection::split(stream, self.config.remote_timeout);
        let tunnel = TunnelConn::new(conn, Arc::clone(self), conn_id);
        if let Err(err) = tunnel.init().await {
            tunnel.conn.close().await;
            return Err(err);
        }
        Ok((tunnel, reader))
    }

    /// One dial/serve cycle. Returns true when the loop should exit.
    async fn connect(self: &Arc<Self>, dialer: &Dialer, conn_id: u64) -> bool {
        let guard = self.init_lock.lock().await;
        let parked = self.idle_manager.init_idle(conn_id);
        if parked {
            drop(guard);
            info!(conn_id, "waiting to connect to remote");
        } else {
            info!(conn_id, "trying to connect to remote");
            match self.init_conn(dialer, conn_id).await {
                Ok((tunnel, reader)) => {
                    self.idle_manager.set_idle(conn_id);
                    drop(guard);
                    tunnel.read_loop(reader).await;
                }
                Err(err) => {
                    drop(guard);
                    error!(conn_id, %err, "failed to connect to remote");
                }
            }
        }

        self.idle_manager.set_wait(conn_id);
        if self.is_closing() {
            return true;
        }
        tokio::time::sleep(self.config.reconnect_delay).await;
        self.idle_manager.wait_idle(conn_id).await;
        self.is_closing()
    }

    async fn connect_loop(self: Arc<Self>, dialer: Dialer, conn_id: u64) {
        while !self.is_closing() {
            if self.connect(&dialer, conn_id).await {
                break;
            }
        }
        info!(conn_id, "connect loop exited");
    }
}

/// The client agent: keeps tunnels to the server and serves tasks arriving
/// over them.
pub struct Client {
    inner: Arc<ClientInner>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Client {
    pub fn new(mut config: ClientConfig) -> Result<Self, ClientError> {
        validate(&mut config)?;
        let services = Arc::new(parse_services(&config)?);
        let idle_manager = IdleManager::new(config.remote_idle_connections);
        let inner = Arc::new(ClientInner {
            idle_manager,
            services: RwLock::new(services),
            tunnels: RwLock::new(HashMap::new()),
            ready: Notify::new(),
            closing: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            reload_pending: AtomicU32::new(0),
            reload_done: Notify::new(),
            config,
        });
        Ok(Self {
            inner,
            handles: StdMutex::new(Vec::new()),
        })
    }

    /// Spawn the connect loops. Returns immediately; use
    /// [`Client::wait_until_ready`] to block until a tunnel is up.
    pub fn start(&self) -> Result<(), ClientError> {
        let tls_options = TlsOptions {
            root_cert: self.inner.config.remote_cert.clone(),
            insecure: self.inner.config.remote_cert_insecure,
        };
        let dialer = Dialer::new(&self.inner.config.remotes, &tls_options)?;

        let mut handles = self.handles.lock().unwrap();
        for conn_id in 1..=u64::from(self.inner.config.remote_connections) {
            let inner = Arc::clone(&self.inner);
            let dialer = dialer.clone();
            handles.push(tokio::spawn(inner.connect_loop(dialer, conn_id)));
        }
        Ok(())
    }

    /// Wait until at least one tunnel has completed the ready handshake.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let inner = &self.inner;
        tokio::time::timeout(timeout, async {
            loop {
                let mut notified = std::pin::pin!(inner.ready.notified());
                notified.as_mut().enable();
                if !inner.tunnels.read().unwrap().is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| ClientError::ReadyTimeout)
    }

    pub fn tunnel_count(&self) -> usize {
        self.inner.tunnels.read().unwrap().len()
    }

    /// Idle-manager status per connection id, for diagnostics.
    pub fn pool_status(&self) -> HashMap<u64, Status> {
        self.inner.idle_manager.statuses()
    }

    /// Graceful shutdown: ask every tunnel to drain, then wait for the
    /// connect loops to finish.
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let tunnels: Vec<_> = self.inner.tunnels.read().unwrap().values().cloned().collect();
        for tunnel in tunnels {
            tunnel.conn.mark_draining();
            let _ = tunnel.conn.send_close().await;
        }
        self.inner.idle_manager.close();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("client shut down");
    }

    /// Abrupt shutdown: force-close every tunnel and stop the loops.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let tunnels: Vec<_> = self.inner.tunnels.read().unwrap().values().cloned().collect();
        for tunnel in tunnels {
            let _ = tunnel.conn.send_force_close().await;
            tunnel.conn.close().await;
        }
        self.inner.idle_manager.close();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        info!("client closed");
    }

    /// Re-declare services on every live tunnel and wait for each to
    /// acknowledge the update.
    pub async fn reload_services(&self, config: &ClientConfig) -> Result<(), ClientError> {
        if self.inner.is_closing() {
            return Err(ClientError::Closing);
        }
        let services = Arc::new(parse_services(config)?);
        if *services == *self.inner.current_services() {
            return Err(ClientError::ReloadUnchanged);
        }

        let mut options_buf = BytesMut::new();
        encode_options(
            &self.inner.config.id,
            &service_options(&services),
            &mut options_buf,
        )?;

        *self.inner.services.write().unwrap() = services;

        let tunnels: Vec<_> = self.inner.tunnels.read().unwrap().values().cloned().collect();
        self.inner
            .reload_pending
            .store(tunnels.len() as u32, Ordering::Release);
        for tunnel in &tunnels {
            tunnel.conn.send_services(&options_buf).await?;
        }

        let inner = &self.inner;
        tokio::time::timeout(RELOAD_TIMEOUT, async {
            loop {
                let mut notified = std::pin::pin!(inner.reload_done.notified());
                notified.as_mut().enable();
                if inner.reload_pending.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| ClientError::ReloadTimeout)?;
        info!("services reloaded");
        Ok(())
    }
}
