use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::context::CallContext;
use crate::error::CallError;
use crate::options::CallOptions;
use crate::runnable::Runnable;
use crate::transport::StreamClient;
use crate::wire::CallHeader;

/// One hop served by a remote function runner over the stream transport.
#[derive(Debug, Clone)]
pub struct RemoteCall {
    client: Arc<StreamClient>,
    function: String,
}

impl RemoteCall {
    pub fn new(client: Arc<StreamClient>, function: impl Into<String>) -> Self {
        Self {
            client,
            function: function.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    pub async fn ensure_connected(&self, ctx: &CallContext) -> Result<(), CallError> {
        self.client.ensure_connected(ctx).await
    }
}

#[async_trait]
impl Runnable for RemoteCall {
    async fn run(
        &self,
        ctx: &CallContext,
        options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        let mut header = CallHeader::single(self.function.clone(), options.clone());
        // The runner enforces what is left of our deadline on its side too.
        if let Some(deadline) = ctx.deadline() {
            header = header.with_timeout(deadline.saturating_duration_since(tokio::time::Instant::now()));
        }
        self.client.call(ctx, header, input, output).await
    }
}
