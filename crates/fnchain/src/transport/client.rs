//! Client side of the duplex call protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::context::CallContext;
use crate::credentials::Connector;
use crate::error::CallError;
use crate::wire::{CallHeader, CallStatus, Connection, Frame, recv_data, send_data};

const DEFAULT_MAX_IDLE: usize = 8;

/// Pooled connections to one `host:port`.
///
/// Idle connections are reused for sequential calls; new ones rotate across
/// every address the host name resolves to.
pub struct StreamClient {
    host: String,
    port: u16,
    endpoint: String,
    connector: Arc<dyn Connector>,
    idle: StdMutex<Vec<Connection>>,
    max_idle: usize,
    next_addr: AtomicUsize,
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint)
            .field("idle", &self.idle_connections())
            .finish_non_exhaustive()
    }
}

impl StreamClient {
    pub fn new(host: impl Into<String>, port: u16, connector: Arc<dyn Connector>) -> Self {
        let host = host.into();
        Self {
            endpoint: format!("{host}:{port}"),
            host,
            port,
            connector,
            idle: StdMutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
            next_addr: AtomicUsize::new(0),
        }
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn idle_connections(&self) -> usize {
        self.idle_pool().len()
    }

    fn idle_pool(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn dial(&self) -> Result<Connection, CallError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| CallError::transport(&self.endpoint, format!("resolve failed: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(CallError::transport(&self.endpoint, "host resolved to no addresses"));
        }
        let addr = addrs[self.next_addr.fetch_add(1, Ordering::Relaxed) % addrs.len()];
        let io = self
            .connector
            .connect(addr)
            .await
            .map_err(|e| CallError::transport(&self.endpoint, format!("connect to {addr} failed: {e}")))?;
        tracing::debug!(endpoint = %self.endpoint, %addr, "Connected");
        Ok(Connection::new(io))
    }

    /// Pop an idle connection the peer has not closed meanwhile.
    fn checkout(&self) -> Option<Connection> {
        let mut idle = self.idle_pool();
        while let Some(mut conn) = idle.pop() {
            // An idle connection has nothing to read; anything else means EOF or garbage.
            match conn.reader.next().now_or_never() {
                None => return Some(conn),
                Some(_) => tracing::trace!(endpoint = %self.endpoint, "Dropping stale connection"),
            }
        }
        None
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle_pool();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    async fn connection(&self, ctx: &CallContext) -> Result<Connection, CallError> {
        if let Some(conn) = self.checkout() {
            return Ok(conn);
        }
        tokio::select! {
            res = self.dial() => res,
            err = ctx.done() => Err(err),
        }
    }

    /// Make sure a connection can be established before any payload moves.
    pub async fn ensure_connected(&self, ctx: &CallContext) -> Result<(), CallError> {
        let conn = self.connection(ctx).await?;
        self.checkin(conn);
        Ok(())
    }

    /// Run one call: send `header`, stream `input` out and the peer's output into `output`.
    pub async fn call(
        &self,
        ctx: &CallContext,
        header: CallHeader,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        let call_id = header.call_id;
        let mut conn = self.connection(ctx).await?;
        tracing::trace!(endpoint = %self.endpoint, %call_id, "Call dispatched");

        let result = tokio::select! {
            res = self.exchange(&mut conn, header, input, output) => res,
            err = ctx.done() => Err(err),
        };
        match result {
            Ok(()) => {
                self.checkin(conn);
                Ok(())
            }
            // Closing the connection is what tells the peer to stop.
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint, %call_id, error = %e, "Call failed");
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        conn: &mut Connection,
        header: CallHeader,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        let endpoint = self.endpoint.as_str();
        let Connection { reader, writer } = conn;
        writer
            .send(Frame::Call(header))
            .await
            .map_err(|e| CallError::transport(endpoint, e))?;

        // Set once every data frame is queued; only the status frame may still be in flight.
        let data_sent = AtomicBool::new(false);
        let status_sent = {
            let send = async {
                send_data(&mut *input, &mut *writer, endpoint).await?;
                data_sent.store(true, Ordering::Release);
                writer
                    .send(Frame::Status(CallStatus::ok()))
                    .await
                    .map_err(|e| CallError::transport(endpoint, e))
            };
            let recv = recv_data(reader, output, endpoint);
            tokio::pin!(send, recv);

            let mut sent = false;
            let status = loop {
                tokio::select! {
                    res = &mut send, if !sent => {
                        res?;
                        sent = true;
                    }
                    res = &mut recv => break res?,
                }
            };
            if !status.success {
                return Err(CallError::Remote {
                    endpoint: endpoint.to_string(),
                    message: status.error.unwrap_or_else(|| "unspecified failure".into()),
                });
            }
            // Finish a status frame that was already on its way rather than queue a second one.
            if !sent && data_sent.load(Ordering::Acquire) {
                send.await?;
                sent = true;
            }
            sent
        };

        // The peer may answer before consuming all input; close our side anyway.
        if status_sent {
            writer
                .flush()
                .await
                .map_err(|e| CallError::transport(endpoint, e))?;
        } else {
            writer
                .send(Frame::Status(CallStatus::ok()))
                .await
                .map_err(|e| CallError::transport(endpoint, e))?;
        }
        Ok(())
    }
}
