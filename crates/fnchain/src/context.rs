//! Per-call context: cancellation, optional deadline, extra process environment.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
pub use tokio_util::sync::CancellationToken;

use crate::error::CallError;

/// Cancellation scope threaded through every hop and process of one call.
///
/// Cloning shares the scope; [`CallContext::child`] derives a narrower one that
/// is cancelled together with its parent but can also be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    env: Arc<Vec<(String, String)>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context cancelled whenever `token` is.
    pub fn from_token(token: &CancellationToken) -> Self {
        Self {
            token: token.child_token(),
            ..Self::default()
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            env: Arc::clone(&self.env),
        }
    }

    /// Child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        child
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why the context is done, if it is.
    pub fn error(&self) -> Option<CallError> {
        if self.deadline_passed() {
            Some(CallError::TimedOut)
        } else if self.token.is_cancelled() {
            Some(CallError::Cancelled)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    ///
    /// Deadline expiry also cancels the token so everything derived from this
    /// context unwinds.
    pub async fn done(&self) -> CallError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        self.token.cancel();
                        return CallError::TimedOut;
                    }
                }
            }
            None => self.token.cancelled().await,
        }
        if self.deadline_passed() {
            CallError::TimedOut
        } else {
            CallError::Cancelled
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}
