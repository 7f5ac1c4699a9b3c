//! Transport credentials, keyed by peer name.
//!
//! TLS and mTLS are a black box here: a [`CredentialProvider`] hands out a
//! [`Connector`] for a peer and the connector turns a socket address into a
//! ready byte stream. The shipped provider connects in plaintext.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::CallError;
use crate::wire::BoxIo;

/// Opens authenticated byte streams to one peer.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<BoxIo>;
}

pub trait CredentialProvider: Send + Sync {
    /// Credentials for `peer` (the host name from the hop identifier).
    fn credentials_for(&self, peer: &str) -> Result<Arc<dyn Connector>, CallError>;
}

/// Plain TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<BoxIo> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Insecure;

impl CredentialProvider for Insecure {
    fn credentials_for(&self, _peer: &str) -> Result<Arc<dyn Connector>, CallError> {
        Ok(Arc::new(TcpConnector))
    }
}
