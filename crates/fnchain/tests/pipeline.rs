//! Gateway and runners wired together over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fnchain::{
    CallContext, CallError, CallHeader, ChainExpression, ExecRunnable, Forwarder, FunctionMetrics,
    FunctionRunner, Gateway, Insecure, NameResolver, StreamClient, StreamServer,
    credentials::TcpConnector,
};
use tokio::net::TcpListener;

async fn spawn_runner(program: &str, args: &[&str]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let runner = FunctionRunner::new(Arc::new(ExecRunnable::new(program, args.iter().copied())));
    tokio::spawn(StreamServer::new(Arc::new(runner)).serve(listener));
    addr
}

async fn spawn_gateway(metrics: Arc<FunctionMetrics>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Gateway::new(
        Forwarder::new(Arc::new(Insecure)).unwrap(),
        Arc::new(NameResolver::default()),
        metrics,
    );
    tokio::spawn(
        StreamServer::new(Arc::new(gateway))
            .with_call_timeout(Some(Duration::from_secs(30)))
            .serve(listener),
    );
    addr
}

fn client(addr: SocketAddr) -> StreamClient {
    StreamClient::new(addr.ip().to_string(), addr.port(), Arc::new(TcpConnector))
}

#[tokio::test]
async fn chain_through_gateway() {
    let upper = spawn_runner("tr", &["a-z", "A-Z"]).await;
    let zeroes = spawn_runner("sed", &["s/O/0/g"]).await;
    let metrics = Arc::new(FunctionMetrics::new());
    let gateway = spawn_gateway(metrics.clone()).await;

    let expr = ChainExpression::parse(&format!("grpc://{upper} | grpc://{zeroes}")).unwrap();
    let client = client(gateway);
    let mut input = &b"hello world\n"[..];
    let mut out = Vec::new();
    client
        .call(&CallContext::new(), expr.to_header(), &mut input, &mut out)
        .await
        .unwrap();
    assert_eq!(out, b"HELL0 W0RLD\n");
    assert_eq!(metrics.get("127.0.0.1").unwrap().calls, 2);

    // The gateway connection is reused for the next call.
    let mut input = &b"go on\n"[..];
    let mut out = Vec::new();
    client
        .call(&CallContext::new(), expr.to_header(), &mut input, &mut out)
        .await
        .unwrap();
    assert_eq!(out, b"G0 0N\n");
    assert_eq!(client.idle_connections(), 1);
}

#[tokio::test]
async fn large_payload_streams_through_two_hops() {
    let first = spawn_runner("cat", &[]).await;
    let second = spawn_runner("cat", &[]).await;
    let gateway = spawn_gateway(Arc::new(FunctionMetrics::new())).await;

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expr = ChainExpression::parse(&format!("grpc://{first} | grpc://{second}")).unwrap();
    let mut input = &payload[..];
    let mut out = Vec::new();
    client(gateway)
        .call(&CallContext::new(), expr.to_header(), &mut input, &mut out)
        .await
        .unwrap();
    assert_eq!(out.len(), payload.len());
    assert!(out == payload);
}

#[tokio::test]
async fn failing_hop_reaches_the_caller() {
    let ok = spawn_runner("cat", &[]).await;
    let failing = spawn_runner("sh", &["-c", "cat >/dev/null; echo exploded >&2; exit 2"]).await;
    let gateway = spawn_gateway(Arc::new(FunctionMetrics::new())).await;

    let expr = ChainExpression::parse(&format!("grpc://{ok} | grpc://{failing}")).unwrap();
    let mut input = &b"payload"[..];
    let mut out = Vec::new();
    let err = client(gateway)
        .call(&CallContext::new(), expr.to_header(), &mut input, &mut out)
        .await
        .unwrap_err();
    match err {
        CallError::Remote { message, .. } => assert!(message.contains("exploded"), "{message}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn header_timeout_bounds_the_chain() {
    let slow = spawn_runner("sleep", &["10"]).await;
    let gateway = spawn_gateway(Arc::new(FunctionMetrics::new())).await;

    let expr = ChainExpression::parse(&format!("grpc://{slow}")).unwrap();
    let header: CallHeader = expr.to_header().with_timeout(Duration::from_millis(200));
    let mut input = &b""[..];
    let mut out = Vec::new();
    let started = std::time::Instant::now();
    let err = client(gateway)
        .call(&CallContext::new(), header, &mut input, &mut out)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.to_string().contains("timed out"), "{err}");
}
