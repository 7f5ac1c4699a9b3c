//! Plain-HTTP ingress.

pub mod routes;
pub mod server;

pub use routes::{GatewayState, RunnerState, gateway_routes, runner_routes};
pub use server::{serve, shutdown_signal};
