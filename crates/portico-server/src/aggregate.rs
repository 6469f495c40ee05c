//! Per-id client aggregate.
//!
//! One instance per authenticated id, created at most once even under
//! concurrent handshakes, destroyed when its last tunnel detaches. Routes
//! inbound tasks to the least-loaded attached tunnel, owns the id's host
//! prefixes and leased TCP listeners, and applies the id's speed and
//! connection quotas (copied from the user record at creation).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use portico_connection::{Connection, FrameReader};
use portico_proto::frame::ErrorCode;
use portico_proto::RESERVED_SIGNAL;

use crate::config::User;
use crate::conn::{RegOptions, ServerConn, TcpReq};
use crate::ports::LeaseError;
use crate::server::{Claim, ServerInner};
use crate::speed::SpeedLimiter;

const TUNNEL_RETRIES: usize = 3;
const TUNNEL_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("no tunnel exists")]
    NoTunnel,
}

struct ListenerHandle {
    port: u16,
    requested: TcpReq,
    cancel: CancellationToken,
}

enum Admit {
    Admitted,
    Stale,
    Full,
}

pub(crate) struct ClientAggregate {
    pub(crate) id: String,
    server: Arc<ServerInner>,
    user: User,
    pub(crate) speed: SpeedLimiter,
    task_id_seed: AtomicU32,
    /// `None` once the last tunnel detached; the aggregate is then dead and
    /// a handshake retry creates a fresh one.
    tunnels: RwLock<Option<HashMap<u64, Arc<ServerConn>>>>,
    /// Serializes handshake registration so two tunnels of one id cannot
    /// interleave prefix/port bookkeeping.
    registration: tokio::sync::Mutex<()>,
    tcp_listeners: StdMutex<HashMap<u16, ListenerHandle>>,
}

impl ClientAggregate {
    pub(crate) fn new(id: &str, user: &User, server: Arc<ServerInner>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            speed: SpeedLimiter::new(user.speed),
            user: user.clone(),
            server,
            task_id_seed: AtomicU32::new(0),
            tunnels: RwLock::new(Some(HashMap::new())),
            registration: tokio::sync::Mutex::new(()),
            tcp_listeners: StdMutex::new(HashMap::new()),
        })
    }

    /// Next task id: monotonic per aggregate, wrapping below the reserved
    /// signal range, never 0.
    pub(crate) fn alloc_task_id(&self) -> u32 {
        let id = self.task_id_seed.fetch_add(1, Ordering::AcqRel) + 1;
        if id >= RESERVED_SIGNAL {
            self.task_id_seed.store(1, Ordering::Release);
            return 1;
        }
        id
    }

    pub(crate) fn contains(&self, key: u64) -> bool {
        self.tunnels
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|map| map.contains_key(&key))
    }

    pub(crate) fn tunnel_count(&self) -> usize {
        self.tunnels
            .read()
            .unwrap()
            .as_ref()
            .map_or(0, HashMap::len)
    }

    /// Pick the tunnel to carry the next task: any tunnel with zero tasks
    /// wins, otherwise the least loaded. Reserves a task slot on the chosen
    /// tunnel.
    fn get_tunnel(&self) -> Option<Arc<ServerConn>> {
        let guard = self.tunnels.read().unwrap();
        let map = guard.as_ref()?;

        let mut chosen: Option<&Arc<ServerConn>> = None;
        let mut min = u32::MAX;
        for tunnel in map.values() {
            let count = tunnel.tasks_count.load(Ordering::Acquire);
            if count == 0 {
                chosen = Some(tunnel);
                break;
            }
            if count < min {
                min = count;
                chosen = Some(tunnel);
            }
        }
        let tunnel = chosen?;
        tunnel.tasks_count.fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(tunnel))
    }

    /// Forward one inbound connection as a task. Retries tunnel selection
    /// briefly to ride out a mid-reconnect window.
    pub(crate) async fn process(
        &self,
        task_conn: Arc<Connection>,
        task_reader: FrameReader,
        service_index: u16,
    ) -> Result<(), ProcessError> {
        let task_id = self.alloc_task_id();
        let mut tunnel = None;
        for attempt in 0..TUNNEL_RETRIES {
            if let Some(found) = self.get_tunnel() {
                tunnel = Some(found);
                break;
            }
            if attempt + 1 < TUNNEL_RETRIES {
                tokio::time::sleep(TUNNEL_RETRY_DELAY).await;
            }
        }
        let Some(tunnel) = tunnel else {
            return Err(ProcessError::NoTunnel);
        };

        tunnel
            .run_task(
                task_id,
                task_conn,
                task_reader,
                service_index,
                self,
                self.server.config.timeout,
                self.server.config.timeout_on_unidirectional_traffic,
            )
            .await;
        Ok(())
    }

    /// Serve one connection accepted on a leased TCP port.
    pub(crate) async fn serve_leased(self: Arc<Self>, stream: tokio::net::TcpStream, service_index: u16) {
        self.server
            .counters
            .accepted
            .fetch_add(1, Ordering::Relaxed);
        stream.set_nodelay(true).ok();
        let (conn, reader) = Connection::split(Box::new(stream), self.server.config.timeout);
        match self.process(Arc::clone(&conn), reader, service_index).await {
            Ok(()) => {
                self.server.counters.served.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(id = %self.id, service_index, %err, "leased port task failed");
                self.server.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        conn.close().await;
    }

    /// Attach a tunnel: admission quota, host-prefix registration, TCP
    /// leases. `Ok(false)` means the aggregate died underneath the caller,
    /// who should fetch-or-create a fresh one and retry.
    pub(crate) async fn add_tunnel(
        self: &Arc<Self>,
        tunnel: &Arc<ServerConn>,
        reg: RegOptions,
    ) -> Result<bool, ErrorCode> {
        let _guard = self.registration.lock().await;

        let admit = {
            let mut guard = self.tunnels.write().unwrap();
            match guard.as_mut() {
                None => Admit::Stale,
                Some(map) => {
                    if map.contains_key(&tunnel.key) {
                        Admit::Admitted
                    } else if map.len() as u32 >= self.user.connections {
                        Admit::Full
                    } else {
                        map.insert(tunnel.key, Arc::clone(tunnel));
                        Admit::Admitted
                    }
                }
            }
        };
        match admit {
            Admit::Stale => return Ok(false),
            Admit::Full => {
                let _ = tunnel
                    .conn
                    .send_error(ErrorCode::ReachedMaxConnections, None)
                    .await;
                return Err(ErrorCode::ReachedMaxConnections);
            }
            Admit::Admitted => {}
        }

        if let Err(code) = self.register_prefixes(tunnel, &reg) {
            let _ = tunnel.conn.send_error(code, None).await;
            return Err(code);
        }

        self.process_tcp_options(tunnel, &reg).await;
        Ok(true)
    }

    /// Claim this handshake's host prefixes in the server routing tables.
    /// A prefix already owned by this id is an idempotent reconnect; one
    /// owned by another id rolls back everything this call added.
    fn register_prefixes(
        self: &Arc<Self>,
        tunnel: &ServerConn,
        reg: &RegOptions,
    ) -> Result<(), ErrorCode> {
        let mut added: Vec<(String, bool)> = Vec::new();
        for (prefix, preg) in &reg.prefixes {
            match self
                .server
                .claim_prefix(prefix, preg.tls, self, preg.service_index)
            {
                Claim::Claimed => {
                    info!(id = %self.id, %prefix, tls = preg.tls, "host prefix added");
                    added.push((prefix.clone(), preg.tls));
                }
                Claim::Ours => {}
                Claim::Conflict => {
                    for (rollback, tls) in added {
                        self.server.remove_prefix_if_owned(&rollback, tls, self);
                        info!(
                            id = %self.id,
                            prefix = %rollback,
                            "rolled back host prefix after conflict"
                        );
                    }
                    return Err(ErrorCode::HostConflict);
                }
            }
        }

        // Prefixes from this tunnel's previous declaration that vanished
        // (or switched TLS-ness) lose their routes.
        let mut registered = tunnel.registered.lock().unwrap();
        for (old, old_reg) in registered.iter() {
            let keep = reg
                .prefixes
                .get(old)
                .is_some_and(|new_reg| new_reg.tls == old_reg.tls);
            if !keep {
                self.server.remove_prefix_if_owned(old, old_reg.tls, self);
                info!(id = %self.id, prefix = %old, "host prefix removed");
            }
        }
        *registered = reg.prefixes.clone();
        Ok(())
    }

    /// Open the requested TCP ports. Failures are per-service: the tunnel
    /// survives, the service stays unserved.
    async fn process_tcp_options(self: &Arc<Self>, tunnel: &Arc<ServerConn>, reg: &RegOptions) {
        let mut requests: Vec<(u16, TcpReq)> = reg.ports.iter().map(|(k, v)| (*k, *v)).collect();
        requests.sort_by_key(|(si, _)| *si);

        for (service_index, req) in requests {
            let existing = {
                let listeners = self.tcp_listeners.lock().unwrap();
                listeners
                    .get(&service_index)
                    .map(|h| (h.port, h.requested))
            };
            if let Some((port, requested)) = existing {
                if req.random || requested.port == req.port {
                    // Same service re-declared on reconnect; keep the lease.
                    let _ = tunnel.conn.send_info_tcp_port_opened(service_index, port).await;
                    continue;
                }
                self.drop_listener(service_index);
            }

            match self.lease(req).await {
                Ok(lease) => {
                    let port = lease.port;
                    let cancel = CancellationToken::new();
                    self.tcp_listeners.lock().unwrap().insert(
                        service_index,
                        ListenerHandle {
                            port,
                            requested: req,
                            cancel: cancel.clone(),
                        },
                    );
                    let aggregate = Arc::clone(self);
                    tokio::spawn(accept_leased(lease.listener, cancel, aggregate, service_index));
                    info!(id = %self.id, service_index, port, "tcp port opened");
                    let _ = tunnel.conn.send_info_tcp_port_opened(service_index, port).await;
                }
                Err(err) => {
                    warn!(
                        id = %self.id,
                        service_index,
                        port = req.port,
                        random = req.random,
                        %err,
                        "failed to open tcp port"
                    );
                    let _ = tunnel
                        .conn
                        .send_error(ErrorCode::FailedToOpenTcpPort, Some(service_index))
                        .await;
                }
            }
        }

        // Services dropped by a re-declaration give their ports back.
        let stale: Vec<u16> = {
            let listeners = self.tcp_listeners.lock().unwrap();
            listeners
                .keys()
                .filter(|si| !reg.ports.contains_key(si))
                .copied()
                .collect()
        };
        for service_index in stale {
            self.drop_listener(service_index);
        }
    }

    async fn lease(&self, req: TcpReq) -> Result<crate::ports::Lease, LeaseError> {
        if req.port != 0 {
            match self.user.ports.lease_specific(req.port).await {
                Ok(lease) => return Ok(lease),
                Err(err) if req.random => {
                    warn!(id = %self.id, port = req.port, %err, "requested port unavailable, trying random");
                }
                Err(err) => return Err(err),
            }
        } else if !req.random {
            return Err(LeaseError::NotAllowed(0));
        }
        self.user.ports.lease_random().await
    }

    fn drop_listener(&self, service_index: u16) {
        let handle = self.tcp_listeners.lock().unwrap().remove(&service_index);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            self.user.ports.release(handle.port);
            info!(
                id = %self.id,
                service_index,
                port = handle.port,
                "tcp listener closed"
            );
        }
    }

    /// Detach a tunnel. Tearing down the last one unregisters the
    /// aggregate, its prefixes, and its listeners, exactly once.
    pub(crate) async fn remove_tunnel(self: &Arc<Self>, tunnel: &Arc<ServerConn>) {
        let emptied = {
            let mut guard = self.tunnels.write().unwrap();
            match guard.as_mut() {
                Some(map) => {
                    if map.remove(&tunnel.key).is_some() && map.is_empty() {
                        *guard = None;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if !emptied {
            return;
        }

        info!(id = %self.id, "last tunnel detached, removing client");
        self.server.remove_aggregate(self, self.user.temp);
        self.server.remove_prefixes_of(self);
        let listeners: Vec<u16> = self.tcp_listeners.lock().unwrap().keys().copied().collect();
        for service_index in listeners {
            self.drop_listener(service_index);
        }
    }

    fn snapshot(&self) -> Vec<Arc<ServerConn>> {
        self.tunnels
            .read()
            .unwrap()
            .as_ref()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Graceful drain: stop taking new tasks, let in-flight ones finish.
    pub(crate) async fn shutdown(&self) {
        for tunnel in self.snapshot() {
            tunnel.conn.mark_draining();
            let _ = tunnel.conn.send_close().await;
        }
    }

    /// Force-close every tunnel and listener.
    pub(crate) async fn close(&self) {
        for tunnel in self.snapshot() {
            let _ = tunnel.conn.send_force_close().await;
            tunnel.conn.close().await;
        }
        let listeners: Vec<u16> = self.tcp_listeners.lock().unwrap().keys().copied().collect();
        for service_index in listeners {
            self.drop_listener(service_index);
        }
    }
}

async fn accept_leased(
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
    aggregate: Arc<ClientAggregate>,
    service_index: u16,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!(id = %aggregate.id, service_index, %err, "leased port accept failed");
                    break;
                }
            },
        };
        tokio::spawn(Arc::clone(&aggregate).serve_leased(stream, service_index));
    }
}
