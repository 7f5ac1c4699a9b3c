//! One process per call.

use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use super::Runnable;
use crate::context::CallContext;
use crate::error::CallError;
use crate::options::CallOptions;

/// Spawns `program args.. options..` for every call.
///
/// Input is streamed to stdin, stdout to `output` and stderr is captured for
/// the error on non-zero exit. In buffered mode stdout is held in memory and
/// only written to `output` after a zero exit, so a failing process never
/// leaks partial output.
#[derive(Debug, Clone)]
pub struct ExecRunnable {
    program: String,
    args: Vec<String>,
    buffered: bool,
}

impl ExecRunnable {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            buffered: false,
        }
    }

    pub fn with_buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    fn command(&self, ctx: &CallContext, options: &CallOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(options.to_args())
            .envs(ctx.env().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

enum Finished {
    Exited(Result<(ExitStatus, Vec<u8>), CallError>),
    Interrupted(CallError),
}

#[async_trait]
impl Runnable for ExecRunnable {
    async fn run(
        &self,
        ctx: &CallContext,
        options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        if let Some(err) = ctx.error() {
            return Err(err);
        }

        let mut child = self
            .command(ctx, options)
            .spawn()
            .map_err(|source| CallError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let pid = child.id();
        tracing::debug!(program = %self.program, ?pid, buffered = self.buffered, "Spawned process");

        let mut captured = Vec::new();
        let finished = {
            let sink: &mut (dyn AsyncWrite + Send + Unpin) = if self.buffered {
                &mut captured
            } else {
                &mut *output
            };
            tokio::select! {
                res = drive(&mut child, input, sink) => Finished::Exited(res),
                err = ctx.done() => Finished::Interrupted(err),
            }
        };

        let (status, stderr) = match finished {
            Finished::Exited(res) => res?,
            Finished::Interrupted(err) => {
                // Kill and reap so nothing outlives the call.
                if let Err(e) = child.start_kill() {
                    tracing::debug!(?pid, error = %e, "Kill after cancellation failed");
                }
                let _ = child.wait().await;
                tracing::debug!(program = %self.program, ?pid, reason = %err, "Process killed");
                return Err(err);
            }
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim_end().to_string();
            tracing::debug!(program = %self.program, ?pid, %status, "Process failed");
            return Err(CallError::ProcessFailed {
                status: status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            tracing::debug!(
                program = %self.program,
                stderr = %String::from_utf8_lossy(&stderr).trim_end(),
                "Process wrote to stderr"
            );
        }

        if self.buffered {
            output.write_all(&captured).await?;
        }
        output.flush().await?;
        Ok(())
    }
}

/// Feed stdin, drain stdout into `sink`, collect stderr and wait for exit.
///
/// Feeding is abandoned once the process has exited: a function may finish
/// without consuming all of its input.
async fn drive(
    child: &mut Child,
    input: &mut (dyn AsyncRead + Send + Unpin),
    sink: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<(ExitStatus, Vec<u8>), CallError> {
    let stdin = child.stdin.take();
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CallError::Internal("child stdout not piped".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| CallError::Internal("child stderr not piped".into()))?;

    let feed = feed_stdin(input, stdin);
    let collect = async {
        let mut errbuf = Vec::new();
        let (out, err) = tokio::join!(
            tokio::io::copy(&mut stdout, sink),
            stderr.read_to_end(&mut errbuf)
        );
        out?;
        err?;
        let status = child.wait().await?;
        Ok::<_, CallError>((status, errbuf))
    };
    tokio::pin!(feed, collect);

    let mut feeding = true;
    loop {
        tokio::select! {
            res = &mut feed, if feeding => {
                feeding = false;
                res?;
            }
            res = &mut collect => return res,
        }
    }
}

async fn feed_stdin(
    input: &mut (dyn AsyncRead + Send + Unpin),
    stdin: Option<ChildStdin>,
) -> Result<(), CallError> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    match tokio::io::copy(input, &mut stdin).await {
        Ok(_) => {}
        // The process stopped reading; its exit status decides the outcome.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if let Err(e) = stdin.shutdown().await
        && e.kind() != io::ErrorKind::BrokenPipe
    {
        return Err(e.into());
    }
    Ok(())
}
