use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};

use super::{PIPE_CAPACITY, Runnable};
use crate::context::CallContext;
use crate::error::CallError;
use crate::options::CallOptions;

/// Ordered composition of runnables, each hop's output piped into the next.
///
/// All hops run concurrently inside the caller's task, joined by bounded
/// in-memory pipes, plus one final drain into `output`. The first hop to fail
/// cancels the shared context; its error is the one returned. A failed hop
/// never signals EOF downstream, so later hops observe cancellation rather
/// than a truncated but well-formed input.
#[derive(Clone, Default)]
pub struct Chain {
    hops: Vec<Arc<dyn Runnable>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").field("hops", &self.hops.len()).finish()
    }
}

struct HopOutcome {
    hop: usize,
    result: Result<(), CallError>,
    /// Write end kept open after a failure.
    held: Option<DuplexStream>,
}

impl Chain {
    pub fn new(hops: Vec<Arc<dyn Runnable>>) -> Self {
        Self { hops }
    }

    pub fn push(&mut self, hop: Arc<dyn Runnable>) {
        self.hops.push(hop);
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Run every hop with its own options; missing entries mean no options.
    pub async fn run_hops(
        &self,
        ctx: &CallContext,
        options: &[CallOptions],
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        if self.hops.is_empty() {
            return Err(CallError::EmptyChain);
        }
        let ctx = ctx.child();
        let no_options = CallOptions::new();

        let mut tasks: FuturesUnordered<BoxFuture<'_, HopOutcome>> = FuturesUnordered::new();
        let mut upstream: Box<dyn AsyncRead + Send + Unpin + '_> = Box::new(input);

        for (hop, runnable) in self.hops.iter().enumerate() {
            let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
            let mut source = std::mem::replace(&mut upstream, Box::new(reader));
            let opts = options.get(hop).unwrap_or(&no_options);
            let ctx = ctx.clone();
            tasks.push(Box::pin(async move {
                let result = runnable.run(&ctx, opts, &mut source, &mut writer).await;
                drop(source);
                let held = match result {
                    Ok(()) => {
                        // Close the pipe so the next hop sees EOF.
                        let _ = writer.shutdown().await;
                        None
                    }
                    Err(_) => Some(writer),
                };
                HopOutcome { hop, result, held }
            }));
        }

        let drain_ctx = ctx.clone();
        let last = self.hops.len();
        tasks.push(Box::pin(async move {
            let result = tokio::select! {
                res = tokio::io::copy(&mut upstream, output) => match res {
                    Ok(_) => output.flush().await.map_err(CallError::from),
                    Err(e) => Err(e.into()),
                },
                err = drain_ctx.done() => Err(err),
            };
            HopOutcome {
                hop: last,
                result,
                held: None,
            }
        }));

        let mut first_error = None;
        let mut held = Vec::new();
        while let Some(outcome) = tasks.next().await {
            match outcome.result {
                Ok(()) => tracing::trace!(hop = outcome.hop, "Hop finished"),
                Err(err) => {
                    if first_error.is_none() {
                        tracing::debug!(hop = outcome.hop, error = %err, "Hop failed, cancelling chain");
                        ctx.cancel();
                        first_error = Some(err);
                    } else {
                        tracing::trace!(hop = outcome.hop, error = %err, "Discarding error from unwinding hop");
                    }
                }
            }
            held.extend(outcome.held);
        }
        drop(held);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Runnable for Chain {
    /// Every hop receives the same `options`.
    async fn run(
        &self,
        ctx: &CallContext,
        options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        let per_hop = vec![options.clone(); self.hops.len()];
        self.run_hops(ctx, &per_hop, input, output).await
    }
}
