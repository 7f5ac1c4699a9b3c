//! Function runner: serves one program to the stream transport and HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::config::{RunnerConfig, RunnerMode};
use crate::context::CallContext;
use crate::error::CallError;
use crate::health::Health;
use crate::options::CallOptions;
use crate::runnable::{Afterburn, AfterburnConfig, ExecRunnable, Runnable};
use crate::transport::CallHandler;
use crate::wire::CallHeader;

pub struct FunctionRunner {
    runnable: Arc<dyn Runnable>,
    afterburn: Option<Arc<Afterburn>>,
    read_limit: Option<u64>,
}

impl std::fmt::Debug for FunctionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRunner")
            .field("afterburn", &self.afterburn)
            .field("read_limit", &self.read_limit)
            .finish_non_exhaustive()
    }
}

impl FunctionRunner {
    pub fn new(runnable: Arc<dyn Runnable>) -> Self {
        Self {
            runnable,
            afterburn: None,
            read_limit: None,
        }
    }

    /// Runner around a warm process; health follows its state.
    pub fn warm(afterburn: Arc<Afterburn>) -> Self {
        Self {
            runnable: afterburn.clone(),
            afterburn: Some(afterburn),
            read_limit: None,
        }
    }

    /// Build the runnable `config` asks for. Afterburn mode spawns the
    /// supervisor, so this must run inside a Tokio runtime.
    pub fn from_config(config: &RunnerConfig) -> Self {
        let runner = match config.mode {
            RunnerMode::Exec => Self::new(Arc::new(ExecRunnable::new(
                config.program.clone(),
                config.args.clone(),
            ))),
            RunnerMode::Buffered => Self::new(Arc::new(
                ExecRunnable::new(config.program.clone(), config.args.clone()).with_buffered(true),
            )),
            RunnerMode::Afterburn(kind) => {
                let afterburn = AfterburnConfig::new(config.program.clone(), config.args.clone())
                    .with_framer(kind.build());
                Self::warm(Arc::new(Afterburn::start(afterburn)))
            }
        };
        tracing::info!(program = %config.program, mode = ?config.mode, "Function runner configured");
        runner.with_read_limit(config.read_limit)
    }

    pub fn with_read_limit(mut self, limit: Option<u64>) -> Self {
        self.read_limit = limit;
        self
    }

    pub fn health(&self) -> Health {
        match &self.afterburn {
            Some(afterburn) if afterburn.is_stopped() => Health::Defunct,
            Some(afterburn) => afterburn.state().into(),
            None => Health::Ready,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.afterburn.as_ref().and_then(|a| a.pid())
    }

    /// Run the program once. Input past the read limit is cut off.
    pub async fn run(
        &self,
        ctx: &CallContext,
        options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        match self.read_limit {
            Some(limit) => {
                let mut limited = input.take(limit);
                self.runnable.run(ctx, options, &mut limited, output).await
            }
            None => self.runnable.run(ctx, options, input, output).await,
        }
    }

    pub async fn shutdown(&self) {
        if let Some(afterburn) = &self.afterburn {
            afterburn.shutdown().await;
        }
    }
}

#[async_trait]
impl CallHandler for FunctionRunner {
    async fn handle(
        &self,
        ctx: &CallContext,
        header: &CallHeader,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        header.validate()?;
        if header.chain.len() != 1 {
            return Err(CallError::Malformed(format!(
                "a runner serves one function, got {} hops",
                header.chain.len()
            )));
        }
        self.run(ctx, &header.options[0], input, output).await
    }
}
