//! Server side of one tunnel connection.
//!
//! A `ServerConn` runs the handshake, registers the client's declared
//! services, then serves the steady-state frame loop. Inbound public
//! connections become tasks: each is forwarded over a chosen tunnel as
//! `ServicesData`/`Data` frames and the response bytes are routed back by
//! the tunnel's read loop using the task table kept here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use portico_connection::{Connection, CopyError, FrameReader};
use portico_proto::frame::{
    encode_data_header, encode_services_data_header, encode_task_close, ErrorCode, FrameHeader,
    Signal, TaskOption,
};
use portico_proto::handshake::{decode_options, Handshake, HandshakeError, ServiceOption};
use portico_proto::{MAGIC, VERSION};

use crate::aggregate::ClientAggregate;
use crate::config::User;
use crate::server::ServerInner;

const CHUNK: usize = 32 * 1024;

static CONN_KEY: AtomicU64 = AtomicU64::new(1);

/// Host prefix registration carried by a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrefixReg {
    pub tls: bool,
    pub service_index: u16,
}

/// TCP port request carried by a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TcpReq {
    pub port: u16,
    pub random: bool,
}

/// Handshake options resolved against a user's permissions, ready to
/// register.
#[derive(Debug, Clone, Default)]
pub(crate) struct RegOptions {
    pub prefixes: HashMap<String, PrefixReg>,
    pub ports: HashMap<u16, TcpReq>,
}

/// Apply quota, regex, and naming policy to the decoded options. Service
/// indexes follow handshake order.
pub(crate) fn build_reg_options(
    options: &[ServiceOption],
    id: &str,
    user: &User,
) -> Result<RegOptions, ErrorCode> {
    let mut reg = RegOptions::default();
    for (index, option) in options.iter().enumerate() {
        let service_index = index as u16;
        match option {
            ServiceOption::OpenHost { prefix, tls } => {
                if user.host.number != 0 && reg.prefixes.len() as u32 + 1 > user.host.number {
                    return Err(ErrorCode::HostNumberLimited);
                }
                // The client's own id bypasses the allow-list and the
                // with-id decoration; it is already namespaced.
                let prefix = if prefix == id {
                    prefix.clone()
                } else {
                    if !user.host.allows(prefix) {
                        return Err(ErrorCode::HostRegexMismatch);
                    }
                    if user.host.with_id {
                        format!("{id}-{prefix}")
                    } else {
                        prefix.clone()
                    }
                };
                reg.prefixes.insert(
                    prefix,
                    PrefixReg {
                        tls: *tls,
                        service_index,
                    },
                );
            }
            ServiceOption::OpenTcpPort { random, port } => {
                if user.ports.is_empty() {
                    return Err(ErrorCode::TcpNumberLimited);
                }
                reg.ports.insert(
                    service_index,
                    TcpReq {
                        port: *port,
                        random: *random,
                    },
                );
            }
        }
    }
    Ok(reg)
}

/// An inbound public connection being proxied as a task: its write side
/// plus the activity clock that stretches its read deadline.
pub(crate) struct TaskStream {
    pub(crate) conn: Arc<Connection>,
    activity: AtomicU64,
    epoch: Instant,
}

impl TaskStream {
    pub(crate) fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            activity: AtomicU64::new(0),
            epoch: Instant::now(),
        })
    }

    /// Stream `len` payload bytes from the tunnel into the public peer.
    /// Write failures are task-local; the remaining payload is drained to
    /// keep the tunnel frame-aligned.
    pub(crate) async fn write_payload(
        &self,
        reader: &mut FrameReader,
        len: u64,
    ) -> Result<(), CopyError> {
        let mut remaining = len;
        while remaining > 0 {
            let chunk = reader
                .read_chunk(remaining.min(CHUNK as u64) as usize)
                .await
                .map_err(CopyError::Read)?;
            remaining -= chunk.len() as u64;
            if let Err(err) = self.conn.write(&chunk).await {
                reader.discard(remaining).await.map_err(CopyError::Read)?;
                return Err(CopyError::Write(err));
            }
        }
        self.touch();
        Ok(())
    }

    pub(crate) fn touch(&self) {
        self.activity
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = self.activity.load(Ordering::Relaxed);
        self.epoch.elapsed() - Duration::from_millis(last)
    }
}

/// One tunnel connection on the server.
pub(crate) struct ServerConn {
    pub(crate) conn: Arc<Connection>,
    pub(crate) key: u64,
    pub(crate) tasks_count: AtomicU32,
    tasks: RwLock<HashMap<u32, Arc<TaskStream>>>,
    /// Prefixes registered by this tunnel's latest handshake, used to diff
    /// re-declarations.
    pub(crate) registered: StdMutex<HashMap<String, PrefixReg>>,
}

impl ServerConn {
    pub(crate) fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            key: CONN_KEY.fetch_add(1, Ordering::Relaxed),
            tasks_count: AtomicU32::new(0),
            tasks: RwLock::new(HashMap::with_capacity(16)),
            registered: StdMutex::new(HashMap::new()),
        })
    }

    fn add_task(&self, task_id: u32, task: Arc<TaskStream>) {
        self.tasks.write().unwrap().insert(task_id, task);
    }

    fn remove_task(&self, task_id: u32) {
        self.tasks.write().unwrap().remove(&task_id);
    }

    fn get_task(&self, task_id: u32) -> Option<Arc<TaskStream>> {
        self.tasks.read().unwrap().get(&task_id).cloned()
    }

    pub(crate) async fn close_tasks(&self) {
        let tasks: Vec<_> = {
            let mut map = self.tasks.write().unwrap();
            map.drain().map(|(_, t)| t).collect()
        };
        for task in tasks {
            task.conn.close().await;
        }
    }

    /// Steady-state frame loop. Returns `true` when the client re-declared
    /// its services and the caller should parse a fresh options sequence.
    pub(crate) async fn read_loop(
        self: &Arc<Self>,
        reader: &mut FrameReader,
        aggregate: &Arc<ClientAggregate>,
        server: &Arc<ServerInner>,
    ) -> bool {
        let timeout = server.config.timeout;
        let cancel = self.conn.cancelled();
        let mut draining = false;

        loop {
            let header = tokio::select! {
                _ = cancel.cancelled() => return false,
                next = read_u32_with_timeout(reader, timeout) => match next {
                    Ok(value) => value,
                    Err(err) => {
                        debug!(conn = self.key, %err, "tunnel read ended");
                        return false;
                    }
                },
            };

            let header = match FrameHeader::classify(header) {
                Ok(header) => header,
                Err(err) => {
                    error!(conn = self.key, %err, "protocol error, closing tunnel");
                    return false;
                }
            };

            match header {
                FrameHeader::Signal(Signal::Ping) => {
                    if !aggregate.contains(self.key) {
                        let _ = self.conn.send_close().await;
                        return false;
                    }
                    if self.conn.send_ping().await.is_err() {
                        return false;
                    }
                }
                FrameHeader::Signal(Signal::Close) => {
                    info!(conn = self.key, "read close signal");
                    if draining {
                        return false;
                    }
                    draining = true;
                    self.conn.mark_draining();
                    aggregate.remove_tunnel(self).await;
                    let _ = self.conn.send_close().await;
                }
                FrameHeader::Signal(Signal::Services) => {
                    info!(conn = self.key, "read services signal");
                    return true;
                }
                FrameHeader::Signal(signal) => {
                    error!(conn = self.key, ?signal, "unexpected signal from client");
                    return false;
                }
                FrameHeader::Task(task_id) => {
                    let Ok(option) = read_u16(reader).await else {
                        return false;
                    };
                    let Ok(option) = TaskOption::try_from(option) else {
                        error!(conn = self.key, task_id, "unknown task option");
                        return false;
                    };
                    match option {
                        TaskOption::Data => {
                            let Ok(len) = read_u32(reader).await else {
                                return false;
                            };
                            if aggregate.speed.enabled() {
                                aggregate.speed.throttle(len, true).await;
                            }
                            match self.get_task(task_id) {
                                Some(task) => {
                                    match task.write_payload(reader, u64::from(len)).await {
                                        Ok(()) => {}
                                        Err(CopyError::Write(err)) => {
                                            debug!(task_id, %err, "public peer closed");
                                        }
                                        Err(CopyError::Read(err)) => {
                                            warn!(task_id, %err, "tunnel read failed");
                                            return false;
                                        }
                                    }
                                }
                                None => {
                                    // The task finished; the response tail
                                    // has nowhere to go.
                                    debug!(task_id, len, "orphan response discarded");
                                    if reader.discard(u64::from(len)).await.is_err() {
                                        return false;
                                    }
                                }
                            }
                        }
                        TaskOption::Close => {
                            if let Some(task) = self.get_task(task_id) {
                                task.conn.close_by_remote().await;
                            }
                        }
                        TaskOption::ServicesData => {
                            error!(conn = self.key, task_id, "unexpected services data");
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Forward one inbound public connection over this tunnel.
    ///
    /// The first frame is `ServicesData`: it names the service and carries
    /// whatever bytes routing already buffered, and is sent immediately even
    /// when empty so the client dials its local service without waiting for
    /// payload. Everything after is `Data`.
    pub(crate) async fn run_task(
        self: &Arc<Self>,
        task_id: u32,
        task_conn: Arc<Connection>,
        mut task_reader: FrameReader,
        service_index: u16,
        aggregate: &ClientAggregate,
        timeout: Duration,
        timeout_on_unidirectional: bool,
    ) {
        let task = TaskStream::new(Arc::clone(&task_conn));
        self.add_task(task_id, Arc::clone(&task));

        let mut write_err = false;
        let cancel = task_conn.cancelled();

        let initial = task_reader.take_buffered();
        if aggregate.speed.enabled() {
            aggregate.speed.throttle(initial.len() as u32, false).await;
        }
        let header = encode_services_data_header(task_id, service_index, initial.len() as u32);
        if self.conn.write_frame(&header, &initial).await.is_err() {
            write_err = true;
        }

        while !write_err {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(timeout, task_reader.read_chunk(CHUNK)) => match result {
                    Ok(Ok(chunk)) => chunk,
                    Ok(Err(_)) => break,
                    Err(_) => {
                        if !timeout_on_unidirectional && task.idle_for() < timeout {
                            continue;
                        }
                        break;
                    }
                },
            };
            if aggregate.speed.enabled() {
                aggregate.speed.throttle(chunk.len() as u32, false).await;
            }
            let header = encode_data_header(task_id, chunk.len() as u32);
            if self.conn.write_frame(&header, &chunk).await.is_err() {
                write_err = true;
            }
        }

        self.remove_task(task_id);
        if !write_err && !task_conn.is_closed_by_remote() {
            write_err = self
                .conn
                .write(&encode_task_close(task_id))
                .await
                .is_err();
        }
        task_conn.close().await;

        if self.tasks_count.fetch_sub(1, Ordering::AcqRel) == 1 && self.conn.is_draining() {
            let _ = self.conn.send_force_close().await;
            self.conn.close().await;
        } else if write_err {
            self.conn.close().await;
        }
    }
}

async fn read_u16(reader: &mut FrameReader) -> Result<u16, ()> {
    reader.read_u16().await.map_err(|_| ())
}

async fn read_u32(reader: &mut FrameReader) -> Result<u32, ()> {
    reader.read_u32().await.map_err(|_| ())
}

async fn read_u32_with_timeout(reader: &mut FrameReader, timeout: Duration) -> Result<u32, String> {
    if timeout > Duration::ZERO {
        match tokio::time::timeout(timeout, reader.read_u32()).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err("read timed out".to_owned()),
        }
    } else {
        reader.read_u32().await.map_err(|e| e.to_string())
    }
}

/// Read a complete handshake off the stream, feeding the decoder until it
/// stops reporting `Incomplete`. The overall deadline covers the whole
/// exchange.
pub(crate) async fn read_handshake(
    reader: &mut FrameReader,
    max_options: u16,
    timeout: Duration,
) -> Result<Handshake, HandshakeError> {
    let deadline = tokio::time::Instant::now() + effective(timeout);
    loop {
        match Handshake::decode(reader.buffer(), max_options) {
            Ok((handshake, consumed)) => {
                reader.consume(consumed);
                return Ok(handshake);
            }
            Err(HandshakeError::Incomplete) => {
                fill_by(reader, deadline).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Read a bare options sequence (a `Services` re-declaration payload).
pub(crate) async fn read_options_sequence(
    reader: &mut FrameReader,
    id: &str,
    max_options: u16,
    timeout: Duration,
) -> Result<Vec<ServiceOption>, HandshakeError> {
    let deadline = tokio::time::Instant::now() + effective(timeout);
    loop {
        match decode_options(reader.buffer(), id, max_options) {
            Ok((options, consumed)) => {
                reader.consume(consumed);
                return Ok(options);
            }
            Err(HandshakeError::Incomplete) => {
                fill_by(reader, deadline).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

fn effective(timeout: Duration) -> Duration {
    if timeout > Duration::ZERO {
        timeout
    } else {
        Duration::from_secs(90)
    }
}

async fn fill_by(
    reader: &mut FrameReader,
    deadline: tokio::time::Instant,
) -> Result<(), HandshakeError> {
    match tokio::time::timeout_at(deadline, reader.fill()).await {
        Ok(Ok(_)) => Ok(()),
        // Out of bytes or out of time: the handshake never completed.
        Ok(Err(_)) | Err(_) => Err(HandshakeError::Incomplete),
    }
}

/// Dispatch one accepted stream: tunnel connections announce themselves
/// with the magic prefix, everything else is routed by its `Host:` header.
pub(crate) async fn handle_connection(
    server: Arc<ServerInner>,
    stream: tokio::net::TcpStream,
    peer_ip: IpAddr,
) {
    server.counters.accepted.fetch_add(1, Ordering::Relaxed);
    stream.set_nodelay(true).ok();
    let (conn, mut reader) = Connection::split(Box::new(stream), server.config.timeout);

    let start = Instant::now();
    let handled = handle_stream(&server, &conn, &mut reader, peer_ip).await;
    if !handled {
        server.counters.failed.fetch_add(1, Ordering::Relaxed);
    }
    conn.close().await;
    debug!(ip = %peer_ip, handled, elapsed = ?start.elapsed(), "connection done");
}

async fn handle_stream(
    server: &Arc<ServerInner>,
    conn: &Arc<Connection>,
    reader: &mut FrameReader,
    peer_ip: IpAddr,
) -> bool {
    let timeout = effective(server.config.timeout);
    let prelude = match tokio::time::timeout(timeout, reader.peek(2)).await {
        Ok(Ok(bytes)) => [bytes[0], bytes[1]],
        _ => return false,
    };

    if prelude[0] == MAGIC {
        if prelude[1] != VERSION {
            warn!(ip = %peer_ip, version = prelude[1], "unsupported tunnel version");
            return false;
        }
        return handle_tunnel_loop(server, conn, reader, peer_ip).await;
    }

    // Plain proxied connection: route by host prefix.
    let host = match tokio::time::timeout(timeout, crate::http::peek_host(reader)).await {
        Ok(Ok(Some(host))) => host,
        _ => {
            debug!(ip = %peer_ip, "no host header, dropping");
            return false;
        }
    };
    let Some(prefix) = crate::http::prefix_from_host(&host) else {
        debug!(ip = %peer_ip, %host, "unroutable host");
        return false;
    };
    let Some(target) = server.lookup_prefix(prefix, false) else {
        debug!(ip = %peer_ip, prefix, "unknown host prefix");
        return false;
    };

    match target
        .aggregate
        .process(Arc::clone(conn), std::mem::replace(reader, FrameReader::detached()), target.service_index)
        .await
    {
        Ok(()) => {
            server.counters.served.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(err) => {
            warn!(ip = %peer_ip, prefix, %err, "failed to serve");
            false
        }
    }
}

/// Serve one tunnel connection: handshake, registration, frame loop, and
/// the re-handshake cycle driven by `Services` signals.
async fn handle_tunnel_loop(
    server: &Arc<ServerInner>,
    conn: &Arc<Connection>,
    reader: &mut FrameReader,
    peer_ip: IpAddr,
) -> bool {
    if server.throttle.is_blocked(peer_ip) {
        warn!(ip = %peer_ip, "blocked ip, dropping tunnel attempt");
        return false;
    }

    let tunnel = ServerConn::new(Arc::clone(conn));
    let mut joined: Vec<Arc<ClientAggregate>> = Vec::new();
    let mut handled = false;
    let mut reload = false;
    let mut identity: Option<(String, User)> = None;

    loop {
        let options = if let Some((id, _)) = &identity {
            match read_options_sequence(
                reader,
                id,
                server.config.max_handshake_options,
                server.config.timeout,
            )
            .await
            {
                Ok(options) => options,
                Err(err) => {
                    warn!(ip = %peer_ip, %err, "failed to parse re-declared options");
                    break;
                }
            }
        } else {
            let handshake = match read_handshake(
                reader,
                server.config.max_handshake_options,
                server.config.timeout,
            )
            .await
            {
                Ok(handshake) => handshake,
                Err(err) => {
                    if matches!(err, HandshakeError::TooManyOptions(_)) {
                        let _ = conn.send_error(ErrorCode::ReachedMaxOptions, None).await;
                    }
                    warn!(ip = %peer_ip, %err, "failed to parse handshake");
                    break;
                }
            };
            match server.authenticate(&handshake.id, &handshake.secret) {
                Ok(user) => {
                    identity = Some((handshake.id, user));
                    handshake.options
                }
                Err(_) => {
                    server.throttle.record_failure(peer_ip);
                    let err = conn.send_error(ErrorCode::InvalidIdAndSecret, None).await;
                    info!(ip = %peer_ip, id = %handshake.id, send_err = err.is_err(), "invalid id and secret");
                    break;
                }
            }
        };
        let (id, user) = identity.as_ref().expect("identity set above");

        let reg = match build_reg_options(&options, id, user) {
            Ok(reg) => reg,
            Err(code) => {
                error!(ip = %peer_ip, %id, %code, "rejecting handshake options");
                let _ = conn.send_error(code, None).await;
                break;
            }
        };

        let mut attached = false;
        for _ in 0..5 {
            let aggregate = server.get_or_create_aggregate(id, user);
            match aggregate.add_tunnel(&tunnel, reg.clone()).await {
                Ok(true) => {
                    if !joined.iter().any(|a| Arc::ptr_eq(a, &aggregate)) {
                        joined.push(aggregate);
                    }
                    attached = true;
                    break;
                }
                // The aggregate emptied out underneath us; a fresh one will
                // be created on the next attempt.
                Ok(false) => continue,
                Err(code) => {
                    error!(ip = %peer_ip, %id, %code, "failed to attach tunnel");
                    // The tunnel may have been inserted before registration
                    // failed; the cleanup below detaches it.
                    if !joined.iter().any(|a| Arc::ptr_eq(a, &aggregate)) {
                        joined.push(aggregate);
                    }
                    break;
                }
            }
        }
        if !attached {
            break;
        }
        let aggregate = joined.last().expect("attached");

        let sent = if reload {
            conn.send_services(&[]).await
        } else {
            server.counters.tunneling.fetch_add(1, Ordering::Relaxed);
            conn.send_ready().await
        };
        if sent.is_err() {
            break;
        }

        handled = true;
        info!(ip = %peer_ip, %id, reload, "tunnel attached");
        reload = tunnel.read_loop(reader, aggregate, server).await;
        if !reload {
            break;
        }
    }

    for aggregate in &joined {
        aggregate.remove_tunnel(&tunnel).await;
    }
    tunnel.close_tasks().await;
    handled
}
