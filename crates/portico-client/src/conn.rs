//! Client side of one tunnel connection.
//!
//! Owns the handshake, the single-reader frame loop, and the per-tunnel
//! task table. The read loop is the only consumer of the stream; every
//! writer (task pumps, signal replies) goes through the shared
//! [`Connection`] write mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, error, info, warn};

use portico_connection::{Connection, CopyError, FrameReader};
use portico_proto::frame::{
    encode_data_header, encode_task_close, ErrorCode, FrameHeader, InfoCode, Signal, TaskOption,
};
use portico_proto::Handshake;

use crate::client::ClientInner;
use crate::config::{service_options, Service};
use crate::task::{dial_local, HttpTask};

const DIAL_ATTEMPTS: usize = 3;
const CHUNK: usize = 32 * 1024;

/// One tunnel connection and its live tasks.
pub(crate) struct TunnelConn {
    pub(crate) conn: Arc<Connection>,
    pub(crate) client: Arc<ClientInner>,
    pub(crate) conn_id: u64,
    tasks: RwLock<HashMap<u32, Arc<HttpTask>>>,
    tasks_count: AtomicU32,
    finished_tasks: AtomicU64,
    services: RwLock<Arc<Vec<Service>>>,
}

impl TunnelConn {
    pub(crate) fn new(conn: Arc<Connection>, client: Arc<ClientInner>, conn_id: u64) -> Arc<Self> {
        Arc::new(Self {
            conn,
            client,
            conn_id,
            tasks: RwLock::new(HashMap::with_capacity(16)),
            tasks_count: AtomicU32::new(0),
            finished_tasks: AtomicU64::new(0),
            services: RwLock::new(Arc::new(Vec::new())),
        })
    }

    /// Send the handshake: magic, version, id, secret, declared services.
    pub(crate) async fn init(&self) -> Result<(), crate::ClientError> {
        let services = self.client.current_services();
        let handshake = Handshake {
            id: self.client.config.id.clone(),
            secret: self.client.config.secret.clone(),
            options: service_options(&services),
        };
        let buf = handshake.encode()?;
        self.conn.write(&buf).await?;
        Ok(())
    }

    pub(crate) fn set_services(&self, services: Arc<Vec<Service>>) {
        *self.services.write().unwrap() = services;
    }

    pub(crate) fn tasks_len(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    fn get_task(&self, task_id: u32) -> Option<Arc<HttpTask>> {
        self.tasks.read().unwrap().get(&task_id).cloned()
    }

    /// Register a task, closing any predecessor that still holds the id.
    fn insert_task(&self, task_id: u32, task: Arc<HttpTask>) -> Option<Arc<HttpTask>> {
        self.tasks.write().unwrap().insert(task_id, task)
    }

    /// Remove the entry only if it still refers to this task; a replacement
    /// registered under the same id must survive its predecessor's cleanup.
    fn remove_task(&self, task_id: u32, task: &Arc<HttpTask>) {
        let mut tasks = self.tasks.write().unwrap();
        if let Some(current) = tasks.get(&task_id) {
            if Arc::ptr_eq(current, task) {
                tasks.remove(&task_id);
            }
        }
    }

    async fn close_all_tasks(&self) {
        let tasks: Vec<_> = {
            let mut map = self.tasks.write().unwrap();
            map.drain().map(|(_, t)| t).collect()
        };
        for task in tasks {
            task.close().await;
        }
    }

    /// The read loop. Returns when the tunnel dies or drains; the caller's
    /// connect loop decides whether to reconnect.
    pub(crate) async fn read_loop(self: Arc<Self>, mut reader: FrameReader) {
        let mut pings: i32 = 0;
        let mut last_ping: u32 = 0;
        let mut draining = false;
        let mut fatal: Option<String> = None;

        let remote_timeout = self.client.config.remote_timeout;
        let read_timeout = remote_timeout / 2;
        let cancel = self.conn.cancelled();

        while pings <= 3 {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = read_header(&mut reader, read_timeout) => next,
            };
            let header = match next {
                HeaderRead::Value(value) => value,
                HeaderRead::Failed(err) => {
                    if !draining {
                        fatal = Some(err);
                    }
                    break;
                }
                HeaderRead::TimedOut => {
                    // Quiet wire: a deadline on the tunnel stream is a
                    // liveness probe, not an error.
                    if self.conn.send_ping().await.is_err() {
                        break;
                    }
                    pings += 1;
                    debug!(conn_id = self.conn_id, pings, "sent ping");
                    continue;
                }
            };

            let header = match FrameHeader::classify(header) {
                Ok(header) => header,
                Err(err) => {
                    fatal = Some(err.to_string());
                    break;
                }
            };

            match header {
                FrameHeader::Signal(Signal::Ping) => {
                    pings -= 1;
                    last_ping += 1;
                    if draining && last_ping >= 3 && self.tasks_len() == 0 {
                        break;
                    }
                    if last_ping >= 6 {
                        last_ping = 0;
                        if self.client.idle_manager.change_to_wait(self.conn_id) {
                            self.conn.mark_draining();
                            if self.conn.send_close().await.is_err() {
                                break;
                            }
                            info!(conn_id = self.conn_id, "sent close signal");
                        }
                    }
                }
                FrameHeader::Signal(Signal::Close) => {
                    info!(conn_id = self.conn_id, "read close signal");
                    if draining || self.tasks_len() == 0 {
                        break;
                    }
                    draining = true;
                    self.conn.mark_draining();
                }
                FrameHeader::Signal(Signal::Ready) => {
                    self.set_services(self.client.current_services());
                    self.client.add_tunnel(&self);
                    info!(conn_id = self.conn_id, "tunnel started");
                }
                FrameHeader::Signal(Signal::Services) => {
                    self.set_services(self.client.current_services());
                    self.client.ack_reload();
                    info!(conn_id = self.conn_id, "tunnel services updated");
                }
                FrameHeader::Signal(Signal::Error) => {
                    let code = match reader.read_u16().await {
                        Ok(code) => code,
                        Err(err) => {
                            fatal = Some(err.to_string());
                            break;
                        }
                    };
                    match ErrorCode::try_from(code) {
                        Ok(ErrorCode::FailedToOpenTcpPort) => {
                            let service_index = reader.read_u16().await.unwrap_or(u16::MAX);
                            // The service stays unserved; the tunnel lives.
                            error!(
                                conn_id = self.conn_id,
                                service_index, "server failed to open tcp port"
                            );
                        }
                        Ok(code) => {
                            fatal = Some(code.to_string());
                            break;
                        }
                        Err(err) => {
                            fatal = Some(err.to_string());
                            break;
                        }
                    }
                }
                FrameHeader::Signal(Signal::Info) => {
                    if let Err(err) = self.read_info(&mut reader).await {
                        fatal = Some(err);
                        break;
                    }
                }
                FrameHeader::Task(task_id) => {
                    last_ping = 0;
                    match self.handle_task_frame(&mut reader, task_id).await {
                        Ok(()) => {}
                        Err(err) => {
                            fatal = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        self.client.remove_tunnel(self.conn_id, &self);
        self.close_all_tasks().await;
        self.conn.close().await;
        info!(
            conn_id = self.conn_id,
            draining,
            error = fatal.as_deref().unwrap_or(""),
            finished_tasks = self.finished_tasks.load(Ordering::Relaxed),
            pings,
            "tunnel closed"
        );
    }

    async fn read_info(&self, reader: &mut FrameReader) -> Result<(), String> {
        let code = reader.read_u16().await.map_err(|e| e.to_string())?;
        match InfoCode::try_from(code) {
            Ok(InfoCode::TcpPortOpened) => {
                let service_index = reader.read_u16().await.map_err(|e| e.to_string())?;
                let port = reader.read_u16().await.map_err(|e| e.to_string())?;
                info!(
                    conn_id = self.conn_id,
                    service_index, port, "tcp port opened"
                );
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        }
    }

    async fn handle_task_frame(
        self: &Arc<Self>,
        reader: &mut FrameReader,
        task_id: u32,
    ) -> Result<(), String> {
        let option = reader.read_u16().await.map_err(|e| e.to_string())?;
        let option = TaskOption::try_from(option).map_err(|e| e.to_string())?;
        match option {
            TaskOption::ServicesData => {
                let service_index = reader.read_u16().await.map_err(|e| e.to_string())?;
                let services = self.services.read().unwrap().clone();
                let service = services
                    .get(service_index as usize)
                    .cloned()
                    .ok_or_else(|| format!("invalid service index {service_index}"))?;
                let len = reader.read_u32().await.map_err(|e| e.to_string())?;
                self.start_task(reader, task_id, &service, u64::from(len))
                    .await
            }
            TaskOption::Data => {
                let len = reader.read_u32().await.map_err(|e| e.to_string())?;
                match self.get_task(task_id) {
                    Some(task) => match task.write_payload(reader, u64::from(len)).await {
                        Ok(()) => Ok(()),
                        Err(CopyError::Write(err)) => {
                            debug!(task_id, %err, "task writer closed");
                            Ok(())
                        }
                        Err(CopyError::Read(err)) => Err(err.to_string()),
                    },
                    None => {
                        // The task finished while frames were in flight.
                        debug!(task_id, len, "data for unknown task discarded");
                        reader
                            .discard(u64::from(len))
                            .await
                            .map_err(|e| e.to_string())
                    }
                }
            }
            TaskOption::Close => {
                if let Some(task) = self.get_task(task_id) {
                    task.close_by_remote().await;
                }
                Ok(())
            }
        }
    }

    /// First frame of a new task: dial the local service and start the pump.
    async fn start_task(
        self: &Arc<Self>,
        reader: &mut FrameReader,
        task_id: u32,
        service: &Service,
        len: u64,
    ) -> Result<(), String> {
        let stream = match dial_local(&service.local_addr, DIAL_ATTEMPTS).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(task_id, addr = %service.local_addr, %err, "failed to dial local service");
                return reader.discard(len).await.map_err(|e| e.to_string());
            }
        };

        let rewrite_host = service
            .use_local_as_http_host
            .then_some(service.local_addr.as_str());
        let (task, read_half) = match HttpTask::new(stream, rewrite_host) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(task_id, %err, "failed to set up task");
                return reader.discard(len).await.map_err(|e| e.to_string());
            }
        };
        info!(task_id, addr = %service.local_addr, "task started");

        if let Some(old) = self.insert_task(task_id, Arc::clone(&task)) {
            old.close().await;
            info!(task_id, "previous task with same id closed");
        }

        let tunnel = Arc::clone(self);
        let pump_task = Arc::clone(&task);
        let local_timeout = service.local_timeout;
        tokio::spawn(async move {
            run_task(tunnel, pump_task, read_half, task_id, local_timeout).await;
        });

        match task.write_payload(reader, len).await {
            Ok(()) => Ok(()),
            Err(CopyError::Write(err)) => {
                debug!(task_id, %err, "task writer closed during first frame");
                Ok(())
            }
            Err(CopyError::Read(err)) => Err(err.to_string()),
        }
    }
}

enum HeaderRead {
    Value(u32),
    TimedOut,
    Failed(String),
}

async fn read_header(reader: &mut FrameReader, timeout: Duration) -> HeaderRead {
    if timeout > Duration::ZERO {
        match tokio::time::timeout(timeout, reader.read_u32()).await {
            Ok(Ok(value)) => HeaderRead::Value(value),
            Ok(Err(err)) => HeaderRead::Failed(err.to_string()),
            Err(_) => HeaderRead::TimedOut,
        }
    } else {
        match reader.read_u32().await {
            Ok(value) => HeaderRead::Value(value),
            Err(err) => HeaderRead::Failed(err.to_string()),
        }
    }
}

/// Pump the local service's output back through the tunnel as data frames
/// under `task_id`, then run the close handshake for the task.
async fn run_task(
    tunnel: Arc<TunnelConn>,
    task: Arc<HttpTask>,
    mut local: OwnedReadHalf,
    task_id: u32,
    local_timeout: Duration,
) {
    use tokio::io::AsyncReadExt;

    let count = tunnel.tasks_count.fetch_add(1, Ordering::AcqRel) + 1;
    tunnel
        .client
        .idle_manager
        .set_running_with_task_count(tunnel.conn_id, count);

    let cancel = task.cancelled();
    let mut buf = vec![0u8; CHUNK];
    let mut read_err: Option<std::io::Error> = None;
    let mut write_err = false;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(local_timeout, local.read(&mut buf)) => match result {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    read_err = Some(err);
                    break;
                }
                Err(_) => {
                    // Stretch the deadline while the tunnel keeps feeding
                    // this task; only true silence in both directions kills
                    // it.
                    if task.idle_for() < local_timeout {
                        continue;
                    }
                    read_err = Some(std::io::ErrorKind::TimedOut.into());
                    break;
                }
            },
        };

        let header = encode_data_header(task_id, n as u32);
        if tunnel.conn.write_frame(&header, &buf[..n]).await.is_err() {
            write_err = true;
            break;
        }
    }

    if !write_err && !task.is_closed_by_remote() {
        write_err = tunnel
            .conn
            .write(&encode_task_close(task_id))
            .await
            .is_err();
    }

    if let Some(err) = &read_err {
        debug!(task_id, %err, "task read loop error");
    }
    tunnel.remove_task(task_id, &task);
    tunnel.finished_tasks.fetch_add(1, Ordering::Relaxed);
    task.close().await;
    info!(task_id, "task finished");

    if tunnel.tasks_count.fetch_sub(1, Ordering::AcqRel) == 1 {
        tunnel.client.idle_manager.set_idle(tunnel.conn_id);
        if tunnel.conn.is_draining() {
            let _ = tunnel.conn.send_force_close().await;
            tunnel.conn.close().await;
            return;
        }
    }
    if write_err {
        tunnel.conn.close().await;
    }
}
