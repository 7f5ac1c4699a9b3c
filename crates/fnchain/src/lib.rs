//! fnchain: streaming function-chain runtime.
//!
//! A gateway resolves `a | b | c` chain expressions and streams the request
//! through each function in turn. Each function is served by a runner that
//! either spawns a process per call or keeps one warm process and delimits
//! calls with a framer.

pub mod config;
mod context;
pub mod credentials;
mod error;
pub mod forwarder;
pub mod framer;
mod gateway;
mod health;
pub mod metrics;
mod options;
pub mod resolve;
pub mod runnable;
mod runner;
pub mod transport;
mod version;
pub mod wire;

pub use context::{CallContext, CancellationToken};
pub use error::{CallError, ErrorKind};
pub use options::{CallOption, CallOptions};

pub use framer::{FrameError, Framer, FramerKind};
pub use runnable::{Afterburn, AfterburnConfig, Chain, ExecRunnable, ProcessState, Runnable};
pub use wire::{CallHeader, CallId, CallStatus, Frame};

pub use credentials::{Connector, CredentialProvider, Insecure};
pub use forwarder::{ClientCache, Forwarder};
pub use resolve::{ChainExpression, EndpointResolver, HostConfig, NameResolver, Transport, resolve_chain};
pub use transport::{CallHandler, StreamClient, StreamServer};

pub use config::{GatewayConfig, RunnerConfig, RunnerMode};
pub use gateway::Gateway;
pub use health::{Health, HealthResponse};
pub use metrics::{FunctionMetrics, MetricsSink};
pub use runner::FunctionRunner;
pub use version::{FNCHAIN_VERSION, Role, VersionInfo};
