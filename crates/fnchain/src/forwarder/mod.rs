//! Executes resolved hops as one streaming pipeline.
//!
//! Every hop becomes a [`HopRunnable`] (remote stream call or HTTP post) and
//! the hops are composed into a [`Chain`]. Clients and connections are set up
//! before the chain starts, so unreachable endpoints fail the call before any
//! byte moves.

mod cache;
mod http;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use cache::ClientCache;
pub use http::HttpCall;
pub use remote::RemoteCall;

use crate::context::CallContext;
use crate::credentials::CredentialProvider;
use crate::error::CallError;
use crate::options::CallOptions;
use crate::resolve::{HostConfig, Transport};
use crate::runnable::{Chain, Runnable};
use crate::version::FNCHAIN_VERSION;

/// A hop, closed over the transports the forwarder knows.
#[derive(Debug, Clone)]
pub enum HopRunnable {
    Remote(RemoteCall),
    Http(HttpCall),
}

#[async_trait]
impl Runnable for HopRunnable {
    async fn run(
        &self,
        ctx: &CallContext,
        options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        match self {
            Self::Remote(call) => call.run(ctx, options, input, output).await,
            Self::Http(call) => call.run(ctx, options, input, output).await,
        }
    }
}

pub struct Forwarder {
    clients: ClientCache,
    http: reqwest::Client,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self, CallError> {
        Self::with_cache(ClientCache::new(credentials))
    }

    pub fn with_cache(clients: ClientCache) -> Result<Self, CallError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("fnchain/{FNCHAIN_VERSION}"))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CallError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { clients, http })
    }

    pub fn clients(&self) -> &ClientCache {
        &self.clients
    }

    /// Build and connect one runnable per host.
    pub async fn prepare(
        &self,
        ctx: &CallContext,
        hosts: &[HostConfig],
    ) -> Result<Vec<HopRunnable>, CallError> {
        let mut hops = Vec::with_capacity(hosts.len());
        for host in hosts {
            let hop = match host.transport {
                Transport::Remote => {
                    let client = self.clients.get_or_create(host)?;
                    let call = RemoteCall::new(client, host.host.clone());
                    if let Err(e) = call.ensure_connected(ctx).await {
                        if !e.is_interrupted() {
                            self.clients.evict(host);
                        }
                        return Err(e);
                    }
                    HopRunnable::Remote(call)
                }
                Transport::Http => HopRunnable::Http(HttpCall::new(self.http.clone(), host)?),
            };
            tracing::debug!(uri = %host.uri(), "Added hop to pipeline");
            hops.push(hop);
        }
        Ok(hops)
    }

    /// Run `input` through every host in order and write the result to `output`.
    pub async fn forward(
        &self,
        ctx: &CallContext,
        hosts: &[HostConfig],
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        if hosts.is_empty() {
            return Err(CallError::EmptyChain);
        }
        let hops = self.prepare(ctx, hosts).await?;
        let chain = Chain::new(
            hops.into_iter()
                .map(|hop| Arc::new(hop) as Arc<dyn Runnable>)
                .collect(),
        );
        let options: Vec<CallOptions> = hosts.iter().map(|h| h.options.clone()).collect();
        tracing::debug!(hops = chain.len(), "Pipeline constructed");
        chain.run_hops(ctx, &options, input, output).await
    }
}
