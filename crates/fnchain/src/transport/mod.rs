//! Network transports.
//!
//! - **client** / **server**: the duplex call protocol from [`crate::wire`]
//! - **http**: plain-HTTP ingress for gateway and runner

pub mod client;
pub mod http;
pub mod server;

pub use client::StreamClient;
pub use server::{CallHandler, StreamServer};
