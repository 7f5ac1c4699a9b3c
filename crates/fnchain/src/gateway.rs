//! Gateway dispatch: the composition root of one chained call.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::context::CallContext;
use crate::error::CallError;
use crate::forwarder::Forwarder;
use crate::metrics::MetricsSink;
use crate::resolve::{ChainExpression, EndpointResolver, resolve_chain};
use crate::transport::CallHandler;
use crate::wire::CallHeader;

pub struct Gateway {
    forwarder: Forwarder,
    resolver: Arc<dyn EndpointResolver>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("forwarder", &self.forwarder)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        forwarder: Forwarder,
        resolver: Arc<dyn EndpointResolver>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            forwarder,
            resolver,
            metrics,
        }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Resolve `expr`, run it and record one observation per hop.
    ///
    /// Resolution failures reject the call before any connection is made.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        expr: &ChainExpression,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        let hosts = resolve_chain(expr, self.resolver.as_ref())?;
        let started = Instant::now();
        let result = self.forwarder.forward(ctx, &hosts, input, output).await;
        let duration = started.elapsed();

        let failed = result.is_err();
        for host in &hosts {
            self.metrics.observe(&host.host, failed, duration);
        }
        result
    }
}

#[async_trait]
impl CallHandler for Gateway {
    async fn handle(
        &self,
        ctx: &CallContext,
        header: &CallHeader,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        let expr = ChainExpression::try_from(header)?;
        self.dispatch(ctx, &expr, input, output).await
    }
}
