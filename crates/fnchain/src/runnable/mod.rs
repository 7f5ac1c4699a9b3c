//! The uniform execution contract and its local implementations.
//!
//! Every stage of a pipeline (a spawned process, a warm process, a remote
//! hop, a whole chain) is a [`Runnable`]: it consumes `input` until EOF, writes
//! its result to `output` and returns once it is finished. Implementations
//! must honor [`CallContext`] cancellation by terminating whatever they own.

mod afterburn;
mod chain;
mod exec;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::context::CallContext;
use crate::error::CallError;
use crate::options::CallOptions;

pub use afterburn::{Afterburn, AfterburnConfig, ProcessState};
pub use chain::Chain;
pub use exec::ExecRunnable;

/// Buffer size of in-memory pipes between stages.
pub const PIPE_CAPACITY: usize = 64 * 1024;

#[async_trait]
pub trait Runnable: Send + Sync {
    /// Run one call to completion.
    ///
    /// Safe to call again after a previous call returned, whatever its outcome.
    async fn run(
        &self,
        ctx: &CallContext,
        options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError>;
}

#[async_trait]
impl<R: Runnable + ?Sized> Runnable for Arc<R> {
    async fn run(
        &self,
        ctx: &CallContext,
        options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        (**self).run(ctx, options, input, output).await
    }
}
