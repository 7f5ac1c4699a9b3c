//! `fnchain`: run a gateway or a function runner, or invoke a chain.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use fnchain::config::parse_duration;
use fnchain::credentials::TcpConnector;
use fnchain::transport::http::{
    GatewayState, RunnerState, gateway_routes, runner_routes, serve as http_serve, shutdown_signal,
};
use fnchain::{
    CallContext, ChainExpression, FNCHAIN_VERSION, Forwarder, FramerKind, FunctionMetrics,
    FunctionRunner, Gateway, GatewayConfig, Insecure, NameResolver, RunnerConfig, RunnerMode,
    StreamClient, StreamServer,
};

#[derive(Parser, Debug)]
#[command(name = "fnchain")]
#[command(about = "Stream data through chains of functions")]
#[command(version)]
struct Cli {
    /// Log level for fnchain targets; RUST_LOG overrides it
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept chained calls and forward them through the named functions
    Gateway(GatewayArgs),
    /// Serve one program as a function
    Runner(RunnerArgs),
    /// Stream stdin through a chain expression and print the result
    Invoke(InvokeArgs),
}

#[derive(Args, Debug)]
struct GatewayArgs {
    /// Stream transport address
    #[arg(long, env = "FNCHAIN_LISTEN_ADDRESS", default_value = "0.0.0.0:2424")]
    listen: SocketAddr,

    /// HTTP ingress, health and metrics address
    #[arg(long, env = "FNCHAIN_HTTP_ADDRESS", default_value = "0.0.0.0:8000")]
    http_listen: SocketAddr,

    /// Port of functions named without one
    #[arg(long, env = "FNCHAIN_DEFAULT_PORT", default_value_t = fnchain::resolve::DEFAULT_REMOTE_PORT)]
    default_port: u16,

    /// Default call timeout (e.g. 30s, 500ms)
    #[arg(long, env = "FNCHAIN_CALL_TIMEOUT", value_parser = parse_duration)]
    call_timeout: Option<Duration>,
}

#[derive(Args, Debug)]
struct RunnerArgs {
    /// Stream transport address
    #[arg(long, env = "FNCHAIN_LISTEN_ADDRESS", default_value = "0.0.0.0:2424")]
    listen: SocketAddr,

    /// HTTP ingress and health address
    #[arg(long, env = "FNCHAIN_HTTP_ADDRESS", default_value = "0.0.0.0:8080")]
    http_listen: SocketAddr,

    /// Default call timeout (e.g. 30s, 500ms)
    #[arg(long, env = "FNCHAIN_CALL_TIMEOUT", value_parser = parse_duration)]
    call_timeout: Option<Duration>,

    /// Bytes of input passed to the program per call
    #[arg(long, env = "FNCHAIN_READ_LIMIT")]
    read_limit: Option<u64>,

    /// Keep one warm process and delimit calls with this framer
    #[arg(long, env = "FNCHAIN_FRAMER")]
    framer: Option<FramerKind>,

    /// Release output only once the program exits successfully
    #[arg(long, env = "FNCHAIN_BUFFER")]
    buffer: bool,

    /// Program and arguments; defaults to $FNCHAIN_PROCESS or $fprocess
    #[arg(last = true)]
    program: Vec<String>,
}

#[derive(Args, Debug)]
struct InvokeArgs {
    /// Gateway stream transport address
    #[arg(long, default_value = "127.0.0.1:2424")]
    gateway: String,

    /// Call timeout (e.g. 30s, 500ms)
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Chain expression, e.g. "upper | wc l"
    expression: String,
}

/// Initialize tracing with RUST_LOG and LOG_FORMAT support.
fn init_tracing(level: LogLevel) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(format!("fnchain={}", level.as_str()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    let result = match cli.command {
        Command::Gateway(args) => run_gateway(args).await,
        Command::Runner(args) => run_runner(args).await,
        Command::Invoke(args) => run_invoke(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fnchain: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    token
}

async fn run_gateway(args: GatewayArgs) -> anyhow::Result<()> {
    let config = GatewayConfig::default()
        .with_listen(args.listen)
        .with_http_listen(args.http_listen)
        .with_default_port(args.default_port)
        .with_call_timeout(args.call_timeout);
    tracing::info!(version = FNCHAIN_VERSION, ?config, "Starting gateway");

    let metrics = Arc::new(FunctionMetrics::new());
    let gateway = Arc::new(Gateway::new(
        Forwarder::new(Arc::new(Insecure))?,
        Arc::new(NameResolver::new(config.default_port)),
        metrics.clone(),
    ));

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let http_listener = TcpListener::bind(config.http_listen)
        .await
        .with_context(|| format!("failed to bind {}", config.http_listen))?;

    let shutdown = shutdown_token();
    let stream = StreamServer::new(gateway.clone())
        .with_call_timeout(config.call_timeout)
        .with_shutdown(shutdown.clone())
        .serve(listener);
    let app = gateway_routes(GatewayState {
        gateway,
        metrics,
        call_timeout: config.call_timeout,
    });
    let http = http_serve(http_listener, app, shutdown);

    tokio::try_join!(stream, http)?;
    tracing::info!("Gateway stopped");
    Ok(())
}

/// Program from the command line, else from the environment.
fn runner_program(mut program: Vec<String>) -> anyhow::Result<(String, Vec<String>)> {
    if program.is_empty() {
        program = ["FNCHAIN_PROCESS", "fprocess"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
    }
    let mut parts = program.into_iter();
    match parts.next() {
        Some(head) => Ok((head, parts.collect())),
        None => bail!("no program given: pass it after `--` or set FNCHAIN_PROCESS"),
    }
}

async fn run_runner(args: RunnerArgs) -> anyhow::Result<()> {
    let (program, program_args) = runner_program(args.program)?;
    let config = RunnerConfig::new(program, program_args)
        .with_mode(RunnerMode::select(args.framer, args.buffer))
        .with_listen(args.listen)
        .with_http_listen(args.http_listen)
        .with_call_timeout(args.call_timeout)
        .with_read_limit(args.read_limit);
    tracing::info!(version = FNCHAIN_VERSION, ?config, "Starting function runner");

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let http_listener = TcpListener::bind(config.http_listen)
        .await
        .with_context(|| format!("failed to bind {}", config.http_listen))?;

    let runner = Arc::new(FunctionRunner::from_config(&config));
    let shutdown = shutdown_token();
    let stream = StreamServer::new(runner.clone())
        .with_call_timeout(config.call_timeout)
        .with_shutdown(shutdown.clone())
        .serve(listener);
    let app = runner_routes(RunnerState {
        runner: runner.clone(),
        call_timeout: config.call_timeout,
    });
    let http = http_serve(http_listener, app, shutdown);

    let served = tokio::try_join!(stream, http);
    runner.shutdown().await;
    served?;
    tracing::info!("Function runner stopped");
    Ok(())
}

fn split_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("gateway address {addr:?} has no port"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in gateway address {addr:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

async fn run_invoke(args: InvokeArgs) -> anyhow::Result<()> {
    let expr = ChainExpression::parse(&args.expression)?;
    let mut header = expr.to_header();
    if let Some(timeout) = args.timeout {
        header = header.with_timeout(timeout);
    }

    let (host, port) = split_host_port(&args.gateway)?;
    let client = StreamClient::new(host, port, Arc::new(TcpConnector));
    let ctx = CallContext::from_token(&shutdown_token());

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    client.call(&ctx, header, &mut stdin, &mut stdout).await?;
    stdout.flush().await?;
    Ok(())
}
