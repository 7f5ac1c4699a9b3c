//! Server side of the duplex call protocol.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;
use crate::error::CallError;
use crate::runnable::PIPE_CAPACITY;
use crate::wire::{BoxIo, CallHeader, CallStatus, Connection, Frame, FrameReader, send_data};

/// What a server does with one accepted call.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: &CallContext,
        header: &CallHeader,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError>;
}

pub struct StreamServer<H> {
    handler: Arc<H>,
    call_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl<H: CallHandler> StreamServer<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            call_timeout: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Applied to calls whose header carries no timeout.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Stops accepting and closes idle connections once cancelled. Calls in
    /// flight run to completion.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "Stream server listening");
        let server = Arc::new(self);

        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = server.shutdown.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
            }
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server.serve_connection(Box::new(stream), peer.to_string()).await;
            });
        }

        tracing::info!(%addr, "Stream server stopped");
        Ok(())
    }

    /// Serve sequential calls on one connection until it closes or a call fails.
    pub async fn serve_connection(&self, io: BoxIo, peer: String) {
        let mut conn = Connection::new(io);
        tracing::debug!(%peer, "Connection opened");
        loop {
            let frame = tokio::select! {
                frame = conn.reader.next() => frame,
                _ = self.shutdown.cancelled() => break,
            };
            match frame {
                Some(Ok(Frame::Call(header))) => {
                    if !self.serve_call(&mut conn, header, &peer).await {
                        break;
                    }
                }
                Some(Ok(other)) => {
                    tracing::warn!(%peer, kind = other.kind(), "Expected call header");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "Malformed frame");
                    break;
                }
                None => break,
            }
        }
        tracing::debug!(%peer, "Connection closed");
    }

    /// The caller's timeout may narrow the server's limit, never extend it.
    fn effective_timeout(&self, header: &CallHeader) -> Option<Duration> {
        match (header.timeout(), self.call_timeout) {
            (Some(requested), Some(limit)) => Some(requested.min(limit)),
            (requested, limit) => requested.or(limit),
        }
    }

    /// Returns whether the connection can carry another call.
    async fn serve_call(&self, conn: &mut Connection, header: CallHeader, peer: &str) -> bool {
        let call_id = header.call_id;
        let started = Instant::now();
        let ctx = match self.effective_timeout(&header) {
            Some(timeout) => CallContext::new().with_timeout(timeout),
            None => CallContext::new(),
        };
        tracing::debug!(%call_id, %peer, chain = ?header.chain, "Call started");

        let (in_tx, mut in_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut out_tx, mut out_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let Connection { reader, writer } = conn;

        let input = pump_input(reader, in_tx, peer);
        tokio::pin!(input);
        let mut input_result: Option<Result<(), CallError>> = None;

        let result = {
            let handler = async {
                let res = self
                    .handler
                    .handle(&ctx, &header, &mut in_rx, &mut out_tx)
                    .await;
                drop(in_rx);
                let _ = out_tx.shutdown().await;
                drop(out_tx);
                res
            };
            let output = async {
                let res = send_data(&mut out_rx, &mut *writer, peer).await;
                if res.is_err() {
                    ctx.cancel();
                }
                res
            };
            let call = async {
                let (res, out) = tokio::join!(handler, output);
                res.and(out)
            };
            tokio::pin!(call);

            loop {
                tokio::select! {
                    res = &mut call => break res,
                    res = &mut input, if input_result.is_none() => {
                        if let Err(e) = &res {
                            tracing::debug!(%call_id, error = %e, "Caller input failed, cancelling call");
                            ctx.cancel();
                        }
                        input_result = Some(res);
                    }
                }
            }
        };

        // The caller's failure explains the cancellation the handler observed.
        let result = match result {
            Err(e) if e.is_interrupted() && matches!(input_result, Some(Err(_))) => {
                match input_result.take() {
                    Some(Err(caller)) => Err(caller),
                    _ => Err(e),
                }
            }
            other => other,
        };

        let status_sent = writer
            .send(Frame::Status(CallStatus::from_result(&result)))
            .await
            .is_ok();

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => tracing::info!(%call_id, duration_ms, "Call completed"),
            Err(e) if e.is_interrupted() => {
                tracing::info!(%call_id, duration_ms, reason = %e, "Call interrupted")
            }
            Err(e) => tracing::warn!(%call_id, duration_ms, error = %e, "Call failed"),
        }
        if result.is_err() || !status_sent {
            return false;
        }

        // Consume the rest of the caller's input so the next call starts in step.
        let input_result = match input_result {
            Some(res) => res,
            None => tokio::select! {
                res = &mut input => res,
                _ = self.shutdown.cancelled() => return false,
            },
        };
        input_result.is_ok()
    }
}

/// Feed data frames into the handler's input until the caller's status.
///
/// Once the handler stops reading, remaining frames are discarded.
async fn pump_input(reader: &mut FrameReader, pipe: DuplexStream, peer: &str) -> Result<(), CallError> {
    let mut pipe = Some(pipe);
    loop {
        match reader.next().await {
            Some(Ok(Frame::Data(bytes))) => {
                if let Some(w) = pipe.as_mut()
                    && let Err(e) = w.write_all(&bytes).await
                {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        return Err(e.into());
                    }
                    pipe = None;
                }
            }
            Some(Ok(Frame::Status(status))) => {
                if let Some(mut w) = pipe.take() {
                    let _ = w.shutdown().await;
                }
                return match status.success {
                    true => Ok(()),
                    false => Err(CallError::Remote {
                        endpoint: peer.to_string(),
                        message: status.error.unwrap_or_else(|| "caller aborted".into()),
                    }),
                };
            }
            Some(Ok(other)) => {
                return Err(CallError::transport(
                    peer,
                    format!("unexpected {} frame mid-call", other.kind()),
                ));
            }
            Some(Err(e)) => return Err(CallError::transport(peer, e)),
            None => return Err(CallError::transport(peer, "caller closed the connection mid-call")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Connector, TcpConnector};
    use crate::options::CallOptions;
    use crate::transport::StreamClient;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    /// Echoes input; `fail` makes it error after echoing, `early` answers without reading.
    struct TestHandler;

    #[async_trait]
    impl CallHandler for TestHandler {
        async fn handle(
            &self,
            ctx: &CallContext,
            header: &CallHeader,
            input: &mut (dyn AsyncRead + Send + Unpin),
            output: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<(), CallError> {
            match header.chain[0].as_str() {
                "echo" => {
                    tokio::io::copy(input, output).await?;
                    Ok(())
                }
                "early" => {
                    output.write_all(b"done").await?;
                    Ok(())
                }
                "fail" => {
                    let mut buf = Vec::new();
                    input.read_to_end(&mut buf).await?;
                    Err(CallError::Internal("handler refused".into()))
                }
                "hang" => Err(ctx.done().await),
                other => Err(CallError::Config(format!("unknown function {other}"))),
            }
        }
    }

    struct CountingConnector(AtomicUsize);

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, addr: SocketAddr) -> io::Result<BoxIo> {
            self.0.fetch_add(1, Ordering::SeqCst);
            TcpConnector.connect(addr).await
        }
    }

    async fn start_server() -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = StreamServer::new(Arc::new(TestHandler)).with_shutdown(shutdown.clone());
        tokio::spawn(server.serve(listener));
        (addr, shutdown)
    }

    fn client(addr: SocketAddr) -> (StreamClient, Arc<CountingConnector>) {
        let connector = Arc::new(CountingConnector(AtomicUsize::new(0)));
        let client = StreamClient::new(addr.ip().to_string(), addr.port(), connector.clone());
        (client, connector)
    }

    async fn call(client: &StreamClient, function: &str, input: &[u8]) -> (Result<(), CallError>, Vec<u8>) {
        let mut input = input;
        let mut out = Vec::new();
        let res = client
            .call(
                &CallContext::new(),
                CallHeader::single(function, CallOptions::new()),
                &mut input,
                &mut out,
            )
            .await;
        (res, out)
    }

    #[tokio::test]
    async fn echo_round_trip_reuses_connection() {
        let (addr, _shutdown) = start_server().await;
        let (client, connector) = client(addr);
        let big: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();

        let (res, out) = call(&client, "echo", &big).await;
        res.unwrap();
        assert!(out == big);

        let (res, out) = call(&client, "echo", b"").await;
        res.unwrap();
        assert!(out.is_empty());

        assert_eq!(connector.0.load(Ordering::SeqCst), 1);
        assert_eq!(client.idle_connections(), 1);
    }

    #[tokio::test]
    async fn remote_failure_is_reported_and_connection_dropped() {
        let (addr, _shutdown) = start_server().await;
        let (client, connector) = client(addr);

        let (res, _) = call(&client, "fail", b"input").await;
        match res.unwrap_err() {
            CallError::Remote { endpoint, message } => {
                assert_eq!(endpoint, client.endpoint());
                assert!(message.contains("handler refused"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(client.idle_connections(), 0);

        let (res, out) = call(&client, "echo", b"next").await;
        res.unwrap();
        assert_eq!(out, b"next");
        assert_eq!(connector.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn early_answer_keeps_connection_in_step() {
        let (addr, _shutdown) = start_server().await;
        let (client, connector) = client(addr);
        let big = vec![b'z'; 1024 * 1024];

        let (res, out) = call(&client, "early", &big).await;
        res.unwrap();
        assert_eq!(out, b"done");

        let (res, out) = call(&client, "echo", b"after").await;
        res.unwrap();
        assert_eq!(out, b"after");
        assert_eq!(connector.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_cancellation_returns_promptly() {
        let (addr, _shutdown) = start_server().await;
        let (client, _) = client(addr);
        let ctx = CallContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let mut input = &b""[..];
        let mut out = Vec::new();
        let err = client
            .call(&ctx, CallHeader::single("hang", CallOptions::new()), &mut input, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn header_timeout_bounds_the_call() {
        let (addr, _shutdown) = start_server().await;
        let (client, _) = client(addr);
        let mut input = &b""[..];
        let mut out = Vec::new();
        let header = CallHeader::single("hang", CallOptions::new()).with_timeout(Duration::from_millis(100));
        let err = client
            .call(&CallContext::new(), header, &mut input, &mut out)
            .await
            .unwrap_err();
        match err {
            CallError::Remote { message, .. } => assert!(message.contains("timed out"), "{message}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_timeout_cannot_extend_server_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = StreamServer::new(Arc::new(TestHandler))
            .with_call_timeout(Some(Duration::from_millis(100)));
        tokio::spawn(server.serve(listener));

        let (client, _) = client(addr);
        let mut input = &b""[..];
        let mut out = Vec::new();
        let header = CallHeader::single("hang", CallOptions::new()).with_timeout(Duration::from_secs(10));
        let started = Instant::now();
        let err = client
            .call(&CallContext::new(), header, &mut input, &mut out)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[test]
    fn effective_timeout_takes_the_narrower_limit() {
        let server = StreamServer::new(Arc::new(TestHandler)).with_call_timeout(Some(Duration::from_secs(1)));
        let short = CallHeader::single("echo", CallOptions::new()).with_timeout(Duration::from_millis(10));
        let long = CallHeader::single("echo", CallOptions::new()).with_timeout(Duration::from_secs(60));
        let none = CallHeader::single("echo", CallOptions::new());
        assert_eq!(server.effective_timeout(&short), Some(Duration::from_millis(10)));
        assert_eq!(server.effective_timeout(&long), Some(Duration::from_secs(1)));
        assert_eq!(server.effective_timeout(&none), Some(Duration::from_secs(1)));

        let open = StreamServer::new(Arc::new(TestHandler));
        assert_eq!(open.effective_timeout(&long), Some(Duration::from_secs(60)));
        assert_eq!(open.effective_timeout(&none), None);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (client, _) = client(addr);
        let err = client.ensure_connected(&CallContext::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
    }

    #[tokio::test]
    async fn in_memory_connection_serves_calls() {
        let server = StreamServer::new(Arc::new(TestHandler));
        let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move { server.serve_connection(Box::new(a), "mem".into()).await });

        let mut conn = Connection::new(Box::new(b));
        conn.writer
            .send(Frame::Call(CallHeader::single("echo", CallOptions::new())))
            .await
            .unwrap();
        conn.writer
            .send(Frame::Data(tokio_util::bytes::Bytes::from_static(b"hi")))
            .await
            .unwrap();
        conn.writer.send(Frame::Status(CallStatus::ok())).await.unwrap();

        let mut out = Vec::new();
        let status = crate::wire::recv_data(&mut conn.reader, &mut out, "mem").await.unwrap();
        assert!(status.success);
        assert_eq!(out, b"hi");
    }
}
