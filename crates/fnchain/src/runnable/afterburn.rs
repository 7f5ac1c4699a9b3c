//! Warm-process execution.
//!
//! One long-lived process serves every call. A supervisor task owns the
//! process and drives a small state machine:
//!
//! ```text
//! Starting ──spawn──▶ Running{generation} ──exit/kill──▶ Dead{generation}
//!     ▲                                                      │
//!     └──────────────────── restart_delay ◀──────────────────┘
//! ```
//!
//! Calls never start or stop the process. They take exclusive ownership of
//! the current generation's stdio, copy their input to stdin and let the
//! [`Framer`] read exactly one message from stdout. Every generation gets a
//! fresh buffered stdout reader that lives as long as the process, so bytes
//! read ahead of a frame boundary stay available to the next call.
//!
//! Deaths are tracked per generation. A death that no call observed is
//! reported, once, to the next call as [`CallError::ProcessDied`]; kills issued
//! by the runnable itself (cancellation, a desynchronized stream) are not.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Runnable;
use crate::context::CallContext;
use crate::error::CallError;
use crate::framer::{FrameError, Framer, LineFramer};
use crate::options::CallOptions;

/// Lifecycle of the supervised process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running { generation: u64, pid: Option<u32> },
    Dead { generation: u64 },
}

#[derive(Debug, Clone)]
pub struct AfterburnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub framer: Arc<dyn Framer>,
    /// Pause between a death and the next spawn.
    pub restart_delay: Duration,
    /// How long a call waits for a process that is (re)starting.
    pub ready_timeout: Duration,
    /// Proceed against the restarted process instead of failing a call that
    /// arrives after an unobserved death.
    pub retry_after_death: bool,
}

impl AfterburnConfig {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            framer: Arc::new(LineFramer),
            restart_delay: Duration::from_millis(100),
            ready_timeout: Duration::from_secs(10),
            retry_after_death: false,
        }
    }

    pub fn with_framer(mut self, framer: Arc<dyn Framer>) -> Self {
        self.framer = framer;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_retry_after_death(mut self, retry: bool) -> Self {
        self.retry_after_death = retry;
        self
    }
}

/// Stdio of one process generation.
struct ProcessIo {
    generation: u64,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Highest generation numbers per death category.
#[derive(Debug, Default)]
struct DeathLedger {
    /// Any generation known to be gone or doomed.
    dead: AtomicU64,
    /// Generations that died without being asked to.
    crashed: AtomicU64,
    /// Generations whose death some call has already surfaced.
    reported: AtomicU64,
}

impl DeathLedger {
    /// Take the pending unreported crash, if any.
    fn take_unreported(&self) -> Option<u64> {
        let crashed = self.crashed.load(Ordering::Acquire);
        let previous = self.reported.fetch_max(crashed, Ordering::AcqRel);
        (crashed > previous).then_some(crashed)
    }
}

pub struct Afterburn {
    framer: Arc<dyn Framer>,
    ready_timeout: Duration,
    retry_after_death: bool,
    io: Arc<Mutex<Option<ProcessIo>>>,
    state: watch::Receiver<ProcessState>,
    kill_tx: mpsc::UnboundedSender<u64>,
    ledger: Arc<DeathLedger>,
    shutdown: CancellationToken,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Afterburn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Afterburn")
            .field("framer", &self.framer)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Afterburn {
    /// Start supervising `config.program`. Must be called inside a Tokio runtime.
    pub fn start(config: AfterburnConfig) -> Self {
        let (state_tx, state) = watch::channel(ProcessState::Starting);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let io = Arc::new(Mutex::new(None));
        let ledger = Arc::new(DeathLedger::default());
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor {
            program: config.program,
            args: config.args,
            restart_delay: config.restart_delay,
            io: Arc::clone(&io),
            state: state_tx,
            kill_rx,
            ledger: Arc::clone(&ledger),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        Self {
            framer: config.framer,
            ready_timeout: config.ready_timeout,
            retry_after_death: config.retry_after_death,
            io,
            state,
            kill_tx,
            ledger,
            shutdown,
            supervisor: StdMutex::new(Some(handle)),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Pid of the running generation.
    pub fn pid(&self) -> Option<u32> {
        match self.state() {
            ProcessState::Running { pid, .. } => pid,
            _ => None,
        }
    }

    /// True once [`Afterburn::shutdown`] was requested.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop restarting, kill the process and wait for the supervisor to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = match self.supervisor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Afterburn supervisor panicked");
        }
    }

    fn request_kill(&self, generation: u64) {
        self.ledger.dead.fetch_max(generation, Ordering::AcqRel);
        let _ = self.kill_tx.send(generation);
    }

    /// Wait for a live generation newer than every known death.
    async fn wait_running(&self, ctx: &CallContext) -> Result<u64, CallError> {
        let min_generation = self.ledger.dead.load(Ordering::Acquire) + 1;
        let mut state = self.state.clone();
        let ready = async {
            let state = state
                .wait_for(|s| {
                    matches!(s, ProcessState::Running { generation, .. } if *generation >= min_generation)
                })
                .await
                .map_err(|_| CallError::ProcessDied)?;
            match *state {
                ProcessState::Running { generation, .. } => Ok(generation),
                _ => Err(CallError::ProcessDied),
            }
        };
        tokio::select! {
            res = tokio::time::timeout(self.ready_timeout, ready) => match res {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!(timeout = ?self.ready_timeout, "Warm process not ready in time");
                    Err(CallError::ProcessDied)
                }
            },
            err = ctx.done() => Err(err),
        }
    }
}

impl Drop for Afterburn {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Runnable for Afterburn {
    /// Options and extra environment are ignored: the process is already running.
    async fn run(
        &self,
        ctx: &CallContext,
        _options: &CallOptions,
        input: &mut (dyn AsyncRead + Send + Unpin),
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CallError> {
        if let Some(err) = ctx.error() {
            return Err(err);
        }
        if self.shutdown.is_cancelled() {
            return Err(CallError::ProcessDied);
        }

        if let Some(generation) = self.ledger.take_unreported() {
            if !self.retry_after_death {
                tracing::warn!(generation, "Warm process died since the last call");
                return Err(CallError::ProcessDied);
            }
            tracing::info!(generation, "Warm process died since the last call, using its replacement");
        }

        let expected = self.wait_running(ctx).await?;
        let mut guard = tokio::select! {
            guard = self.io.lock() => guard,
            err = ctx.done() => return Err(err),
        };
        let io = match guard.as_mut() {
            Some(io)
                if io.generation >= expected
                    && io.generation > self.ledger.dead.load(Ordering::Acquire) =>
            {
                io
            }
            _ => return Err(CallError::ProcessDied),
        };
        let generation = io.generation;
        tracing::trace!(generation, "Call acquired warm process");

        let ProcessIo { stdin, stdout, .. } = io;
        let exchange = async {
            let feed = async {
                tokio::io::copy(input, stdin).await?;
                stdin.flush().await?;
                Ok::<_, std::io::Error>(())
            };
            let frame = self.framer.copy(output, stdout);
            tokio::try_join!(
                async { feed.await.map_err(feed_error) },
                async { frame.await.map_err(frame_error) },
            )
        };

        let result = tokio::select! {
            res = exchange => res.map(|_| ()),
            err = ctx.done() => Err(err),
        };

        match &result {
            Ok(()) => {}
            Err(CallError::ProcessDied) => {
                tracing::warn!(generation, "Warm process died during call");
                self.ledger.reported.fetch_max(generation, Ordering::AcqRel);
                self.request_kill(generation);
            }
            Err(err) => {
                // Stdio position is unknown after a partial exchange.
                tracing::debug!(generation, error = %err, "Recycling warm process");
                self.request_kill(generation);
            }
        }
        result
    }
}

fn feed_error(e: std::io::Error) -> CallError {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        CallError::ProcessDied
    } else {
        CallError::Io(e)
    }
}

fn frame_error(e: FrameError) -> CallError {
    match e {
        FrameError::Eof => CallError::ProcessDied,
        FrameError::Io(e) => feed_error(e),
        other => CallError::Framing(other),
    }
}

struct Supervisor {
    program: String,
    args: Vec<String>,
    restart_delay: Duration,
    io: Arc<Mutex<Option<ProcessIo>>>,
    state: watch::Sender<ProcessState>,
    kill_rx: mpsc::UnboundedReceiver<u64>,
    ledger: Arc<DeathLedger>,
    shutdown: CancellationToken,
}

enum Event {
    Exited(std::io::Result<std::process::ExitStatus>),
    Kill(u64),
    Shutdown,
}

impl Supervisor {
    async fn run(mut self) {
        let mut generation = 0u64;
        while !self.shutdown.is_cancelled() {
            generation += 1;
            self.state.send_replace(ProcessState::Starting);

            match self.spawn(generation) {
                Ok(child) => {
                    if self.supervise(generation, child).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(program = %self.program, generation, error = %e, "Failed to start warm process");
                    self.ledger.dead.fetch_max(generation, Ordering::AcqRel);
                    self.ledger.crashed.fetch_max(generation, Ordering::AcqRel);
                    self.state.send_replace(ProcessState::Dead { generation });
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.restart_delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        *self.io.lock().await = None;
        tracing::debug!(program = %self.program, "Afterburn supervisor stopped");
    }

    fn spawn(&self, generation: u64) -> std::io::Result<Child> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(program = %self.program, generation, pid = ?child.id(), "Warm process started");
        Ok(child)
    }

    /// Own one generation until it exits. Returns true on shutdown.
    async fn supervise(&mut self, generation: u64, mut child: Child) -> bool {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            tracing::error!(generation, "Warm process stdio not piped");
            let _ = child.start_kill();
            return true;
        };
        let pid = child.id();
        *self.io.lock().await = Some(ProcessIo {
            generation,
            stdin,
            stdout: BufReader::new(stdout),
        });
        self.state
            .send_replace(ProcessState::Running { generation, pid });

        let mut requested = false;
        let shutdown = loop {
            let event = tokio::select! {
                status = child.wait() => Event::Exited(status),
                req = self.kill_rx.recv() => match req {
                    Some(g) => Event::Kill(g),
                    None => Event::Shutdown,
                },
                _ = self.shutdown.cancelled() => Event::Shutdown,
            };
            match event {
                Event::Exited(status) => {
                    let crashed = !requested;
                    if crashed {
                        self.ledger.crashed.fetch_max(generation, Ordering::AcqRel);
                    }
                    match status {
                        Ok(status) => tracing::warn!(generation, ?pid, %status, crashed, "Warm process exited"),
                        Err(e) => tracing::warn!(generation, ?pid, error = %e, "Failed to wait for warm process"),
                    }
                    break false;
                }
                Event::Kill(g) if g == generation && !requested => {
                    tracing::debug!(generation, ?pid, "Killing warm process on request");
                    requested = true;
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(generation, error = %e, "Kill failed");
                    }
                }
                // Stale request for an earlier generation.
                Event::Kill(_) => {}
                Event::Shutdown => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    tracing::info!(generation, ?pid, "Warm process stopped");
                    break true;
                }
            }
        };

        self.ledger.dead.fetch_max(generation, Ordering::AcqRel);
        self.state.send_replace(ProcessState::Dead { generation });
        shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::FramerKind;
    use std::time::Instant;

    async fn call(runnable: &Afterburn, input: &[u8]) -> Result<Vec<u8>, CallError> {
        let mut input = input;
        let mut out = Vec::new();
        runnable
            .run(&CallContext::new(), &CallOptions::new(), &mut input, &mut out)
            .await?;
        Ok(out)
    }

    async fn wait_for_generation(runnable: &Afterburn, min: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let ProcessState::Running { generation, .. } = runnable.state()
                && generation >= min
            {
                return;
            }
            assert!(Instant::now() < deadline, "no generation {min} in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn cat(retry: bool) -> Afterburn {
        Afterburn::start(
            AfterburnConfig::new("cat", Vec::<String>::new())
                .with_framer(FramerKind::Line.build())
                .with_restart_delay(Duration::from_millis(20))
                .with_retry_after_death(retry),
        )
    }

    #[tokio::test]
    async fn sequential_calls_see_only_their_own_line() {
        let runnable = cat(false);
        assert_eq!(call(&runnable, b"first\n").await.unwrap(), b"first\n");
        assert_eq!(call(&runnable, b"second\n").await.unwrap(), b"second\n");
        runnable.shutdown().await;
    }

    #[tokio::test]
    async fn one_frame_per_call_even_when_more_is_buffered() {
        let runnable = cat(false);
        // Both lines come back; the second stays buffered for the next call.
        assert_eq!(call(&runnable, b"a\nb\n").await.unwrap(), b"a\n");
        assert_eq!(call(&runnable, b"").await.unwrap(), b"b\n");
        runnable.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_process_is_reported_then_replaced() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let runnable = cat(false);
        call(&runnable, b"warm\n").await.unwrap();
        let pid = runnable.pid().unwrap();
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

        let started = Instant::now();
        let err = call(&runnable, b"after kill\n").await.unwrap_err();
        assert!(matches!(err, CallError::ProcessDied), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));

        // Reported once; the replacement serves the next call.
        assert_eq!(call(&runnable, b"again\n").await.unwrap(), b"again\n");
        assert_ne!(runnable.pid(), Some(pid));
        runnable.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unobserved_death_fails_fast_unless_retry_is_enabled() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        for retry in [false, true] {
            let runnable = cat(retry);
            wait_for_generation(&runnable, 1).await;
            let pid = runnable.pid().unwrap();
            kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
            wait_for_generation(&runnable, 2).await;

            let res = call(&runnable, b"x\n").await;
            if retry {
                assert_eq!(res.unwrap(), b"x\n");
            } else {
                assert!(matches!(res, Err(CallError::ProcessDied)));
                assert_eq!(call(&runnable, b"y\n").await.unwrap(), b"y\n");
            }
            runnable.shutdown().await;
        }
    }

    #[tokio::test]
    async fn cancelled_call_recycles_process_without_reporting() {
        let script = r#"while read l; do if [ "$l" = hang ]; then sleep 30; else echo "$l"; fi; done"#;
        let runnable = Afterburn::start(
            AfterburnConfig::new("sh", ["-c", script])
                .with_restart_delay(Duration::from_millis(20)),
        );

        let ctx = CallContext::new().with_timeout(Duration::from_millis(200));
        let mut input = &b"hang\n"[..];
        let mut out = Vec::new();
        let err = runnable
            .run(&ctx, &CallOptions::new(), &mut input, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::TimedOut));
        assert!(out.is_empty());

        assert_eq!(call(&runnable, b"ok\n").await.unwrap(), b"ok\n");
        runnable.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_output_is_a_framing_error() {
        let runnable = Afterburn::start(
            AfterburnConfig::new("cat", Vec::<String>::new())
                .with_framer(FramerKind::Json.build()),
        );
        let err = call(&runnable, b"{not json}").await.unwrap_err();
        assert!(matches!(err, CallError::Framing(FrameError::Malformed(_))), "{err:?}");
        runnable.shutdown().await;
    }

    #[tokio::test]
    async fn missing_program_never_hangs() {
        let runnable = Afterburn::start(
            AfterburnConfig::new("/nonexistent/fnchain-warm", Vec::<String>::new())
                .with_ready_timeout(Duration::from_millis(300)),
        );
        let err = call(&runnable, b"x\n").await.unwrap_err();
        assert!(matches!(err, CallError::ProcessDied));
        runnable.shutdown().await;
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail() {
        let runnable = cat(false);
        runnable.shutdown().await;
        assert!(matches!(
            call(&runnable, b"x\n").await,
            Err(CallError::ProcessDied)
        ));
    }
}
