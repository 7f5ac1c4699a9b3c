//! HTTP route handlers for gateway and runner.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::config::parse_duration;
use crate::context::CallContext;
use crate::error::{CallError, ErrorKind};
use crate::gateway::Gateway;
use crate::health::{Health, HealthResponse};
use crate::metrics::FunctionMetrics;
use crate::options::CallOptions;
use crate::resolve::ChainExpression;
use crate::runnable::PIPE_CAPACITY;
use crate::runner::FunctionRunner;
use crate::version::{Role, VersionInfo};

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<Gateway>,
    pub metrics: Arc<FunctionMetrics>,
    pub call_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct RunnerState {
    pub runner: Arc<FunctionRunner>,
    pub call_timeout: Option<Duration>,
}

pub fn gateway_routes(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(gateway_health))
        .route("/metrics", get(gateway_metrics))
        .route("/api/v0/invoke/{function}", post(gateway_invoke))
        .with_state(state)
}

pub fn runner_routes(state: RunnerState) -> Router {
    Router::new()
        .route("/health", get(runner_health))
        .route("/", post(runner_invoke))
        .route("/{*path}", post(runner_invoke))
        .with_state(state)
}

/// One HTTP-triggered call, run on its own task.
#[async_trait]
trait Invocation: Send + Sync + 'static {
    async fn invoke(
        &self,
        ctx: &CallContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError>;
}

struct GatewayCall {
    gateway: Arc<Gateway>,
    expr: ChainExpression,
}

#[async_trait]
impl Invocation for GatewayCall {
    async fn invoke(
        &self,
        ctx: &CallContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        self.gateway.dispatch(ctx, &self.expr, input, output).await
    }
}

struct RunnerCall {
    runner: Arc<FunctionRunner>,
    options: CallOptions,
}

#[async_trait]
impl Invocation for RunnerCall {
    async fn invoke(
        &self,
        ctx: &CallContext,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        self.runner.run(ctx, &self.options, input, output).await
    }
}

pub(crate) fn error_status(err: &CallError) -> StatusCode {
    match err.kind() {
        ErrorKind::MalformedExpression => StatusCode::BAD_REQUEST,
        ErrorKind::Transport | ErrorKind::Process | ErrorKind::ProcessDied => StatusCode::BAD_GATEWAY,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Configuration | ErrorKind::Cancelled | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: &CallError) -> Response {
    (error_status(err), format!("{err}\n")).into_response()
}

/// Run `call` with the request body as input and stream its output back.
///
/// The status line waits for the first output byte: a call that fails before
/// producing output gets an error status, a later failure aborts the body.
/// Dropping the response cancels the call.
async fn stream_call(ctx: CallContext, body: Body, call: impl Invocation) -> Response {
    let (mut out_tx, out_rx) = tokio::io::duplex(PIPE_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel::<Result<(), CallError>>();
    let cancel_on_drop = ctx.token().clone().drop_guard();

    let task_ctx = ctx.clone();
    tokio::spawn(async move {
        let mut input = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
        let result = call.invoke(&task_ctx, &mut input, &mut out_tx).await;
        let _ = out_tx.shutdown().await;
        drop(out_tx);
        let _ = done_tx.send(result);
    });

    let mut output = ReaderStream::new(out_rx);
    let first = match output.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => return error_response(&CallError::Io(e)),
        None => {
            return match done_rx.await {
                Ok(Ok(())) => StatusCode::OK.into_response(),
                Ok(Err(err)) => error_response(&err),
                Err(_) => error_response(&CallError::Internal("call task lost".into())),
            };
        }
    };

    let tail = futures::stream::once(async move {
        let _guard = cancel_on_drop;
        let item: Option<io::Result<Bytes>> = match done_rx.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Call failed after output started");
                Some(Err(io::Error::other(err.to_string())))
            }
            Err(_) => Some(Err(io::Error::other("call task lost"))),
        };
        item
    })
    .filter_map(|item| async move { item });

    let body = futures::stream::once(async move { Ok::<Bytes, io::Error>(first) })
        .chain(output)
        .chain(tail);
    Response::new(Body::from_stream(body))
}

fn call_context(timeout: Option<Duration>) -> CallContext {
    match timeout {
        Some(timeout) => CallContext::new().with_timeout(timeout),
        None => CallContext::new(),
    }
}

async fn gateway_invoke(
    State(state): State<GatewayState>,
    Path(function): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Body,
) -> Response {
    let mut timeout = state.call_timeout;
    let mut options = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if key == "timeout" {
            match parse_duration(&value) {
                Ok(d) => timeout = Some(timeout.map_or(d, |t| t.min(d))),
                Err(e) => {
                    return error_response(&CallError::Malformed(format!("timeout: {e}")));
                }
            }
        } else {
            options.push((key, value));
        }
    }
    tracing::info!(%function, "HTTP invoke");

    let options = CallOptions::from_query_pairs(options);
    let expr = match ChainExpression::from_parts(vec![function], vec![options]) {
        Ok(expr) => expr,
        Err(err) => return error_response(&err),
    };
    let call = GatewayCall {
        gateway: state.gateway,
        expr,
    };
    stream_call(call_context(timeout), body, call).await
}

async fn gateway_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: Health::Ready,
        version: VersionInfo::new(Role::Gateway),
        pid: None,
    })
}

async fn gateway_metrics(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(state.metrics.snapshot())
}

async fn runner_health(State(state): State<RunnerState>) -> impl IntoResponse {
    let status = state.runner.health();
    let code = match status {
        Health::Ready => StatusCode::OK,
        Health::Starting | Health::Defunct => StatusCode::SERVICE_UNAVAILABLE,
    };
    let response = HealthResponse {
        status,
        version: VersionInfo::new(Role::Runner),
        pid: state.runner.pid(),
    };
    (code, Json(response))
}

/// Request metadata as process environment: `Http_Method`, `Http_Path`,
/// `Http_Query` and one `Http_<Header_Name>` per header.
pub(crate) fn request_env(method: &Method, uri: &Uri, headers: &HeaderMap) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(headers.len() + 3);
    for name in headers.keys() {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        env.push((format!("Http_{}", canonical_env_name(name.as_str())), value.to_string()));
    }
    env.push(("Http_Method".into(), method.to_string()));
    env.push(("Http_Path".into(), uri.path().to_string()));
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        env.push(("Http_Query".into(), query.to_string()));
    }
    env
}

/// `content-type` → `Content_Type`
fn canonical_env_name(header: &str) -> String {
    header
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("_")
}

async fn runner_invoke(
    State(state): State<RunnerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Body,
) -> Response {
    let env = request_env(&method, &uri, &headers);
    let ctx = call_context(state.call_timeout).with_env(env);
    let call = RunnerCall {
        runner: state.runner,
        options: CallOptions::from_query_pairs(pairs),
    };
    stream_call(ctx, body, call).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Insecure;
    use crate::forwarder::Forwarder;
    use crate::metrics::MetricsSink;
    use crate::resolve::NameResolver;
    use crate::runnable::ExecRunnable;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn response_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn runner_app(program: &str, args: &[&str]) -> Router {
        let runner = FunctionRunner::new(Arc::new(ExecRunnable::new(program, args.iter().copied())));
        runner_routes(RunnerState {
            runner: Arc::new(runner),
            call_timeout: None,
        })
    }

    fn gateway_app() -> (Router, Arc<FunctionMetrics>) {
        let metrics = Arc::new(FunctionMetrics::new());
        let gateway = Gateway::new(
            Forwarder::new(Arc::new(Insecure)).unwrap(),
            Arc::new(NameResolver::default()),
            metrics.clone(),
        );
        let app = gateway_routes(GatewayState {
            gateway: Arc::new(gateway),
            metrics: metrics.clone(),
            call_timeout: None,
        });
        (app, metrics)
    }

    #[tokio::test]
    async fn runner_streams_process_output() {
        let app = runner_app("tr", &["a-z", "A-Z"]);
        let response = app
            .oneshot(Request::post("/anything").body(Body::from("hello")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "HELLO");
    }

    #[tokio::test]
    async fn runner_passes_query_options_and_request_env() {
        let app = runner_app("sh", &["-c", "printf '%s|%s|%s|' \"$Http_Method\" \"$Http_Path\" \"$Http_X_Request_Id\"; printf '%s ' \"$@\"", "sh"]);
        let response = app
            .oneshot(
                Request::post("/fn/path?n=2&verbose")
                    .header("x-request-id", "abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "POST|/fn/path|abc|-n 2 --verbose ");
    }

    #[tokio::test]
    async fn runner_failure_before_output_is_bad_gateway() {
        let app = runner_app("sh", &["-c", "echo nope >&2; exit 3"]);
        let response = app
            .oneshot(Request::post("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response_text(response).await.contains("nope"));
    }

    #[tokio::test]
    async fn runner_failure_after_output_aborts_body() {
        let app = runner_app("sh", &["-c", "echo partial; sleep 0.2; exit 1"]);
        let response = app
            .oneshot(Request::post("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.is_err());
    }

    #[tokio::test]
    async fn runner_health_reports_ready() {
        let app = runner_app("cat", &[]);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert_eq!(json["version"]["role"], "runner");
    }

    #[tokio::test]
    async fn gateway_invoke_unreachable_function_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (app, metrics) = gateway_app();
        let uri = format!("/api/v0/invoke/grpc:%2F%2F{addr}");
        let response = app
            .oneshot(Request::post(uri).body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(metrics.get("127.0.0.1").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn gateway_rejects_bad_timeout() {
        let (app, _) = gateway_app();
        let response = app
            .oneshot(
                Request::post("/api/v0/invoke/echo?timeout=soon")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn gateway_health_and_metrics() {
        let (app, metrics) = gateway_app();
        metrics.observe("echo", false, Duration::from_millis(1));

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert_eq!(json["version"]["role"], "gateway");

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = response_json(response).await;
        assert_eq!(json["echo"]["calls"], 1);
    }

    #[test]
    fn header_names_become_env_names() {
        assert_eq!(canonical_env_name("content-type"), "Content_Type");
        assert_eq!(canonical_env_name("x-request-id"), "X_Request_Id");
        assert_eq!(canonical_env_name("accept"), "Accept");
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(error_status(&CallError::EmptyChain), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&CallError::ProcessDied), StatusCode::BAD_GATEWAY);
        assert_eq!(error_status(&CallError::TimedOut), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            error_status(&CallError::Config("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
