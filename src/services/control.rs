//! Cancellation and deadline handling for blocking external calls.
//!
//! Every call that leaves the process (kubectl, rbd, gpg, the object store)
//! is wrapped in [`CallControl::run`]. Cancelling the shared token drops the
//! in-flight future; child processes are spawned with `kill_on_drop` so the
//! tool dies with it.

use std::{
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why an external call stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    Cancelled,
    TimedOut(Duration),
}

impl fmt::Display for InterruptCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
        }
    }
}

#[derive(Debug, Clone, Copy, Error)]
#[error("{operation} {cause}")]
pub struct Interrupted {
    pub operation: &'static str,
    pub cause: InterruptCause,
}

/// Shared cancellation token plus an optional per-call deadline.
#[derive(Clone, Debug, Default)]
pub struct CallControl {
    token: CancellationToken,
    timeout: Option<Duration>,
}

impl CallControl {
    pub fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self { token, timeout }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Snapshot for work that runs on a blocking thread and polls between chunks.
    pub fn checkpoint(&self, operation: &'static str) -> Checkpoint {
        Checkpoint {
            operation,
            token: self.token.clone(),
            deadline: self.timeout.map(|limit| (Instant::now() + limit, limit)),
        }
    }

    /// Fail fast when the run was cancelled between calls.
    pub fn check(&self, operation: &'static str) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted {
                operation,
                cause: InterruptCause::Cancelled,
            });
        }
        Ok(())
    }

    /// Drive `call` to completion unless the token fires or the deadline passes.
    pub async fn run<F, T, E>(&self, operation: &'static str, call: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Interrupted>,
    {
        self.check(operation)?;

        let bounded = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(E::from(Interrupted {
                        operation,
                        cause: InterruptCause::TimedOut(limit),
                    })),
                },
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(E::from(Interrupted {
                operation,
                cause: InterruptCause::Cancelled,
            })),
            result = bounded => result,
        }
    }
}

/// Cancellation and deadline state carried into a blocking task.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    operation: &'static str,
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl Checkpoint {
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted {
                operation: self.operation,
                cause: InterruptCause::Cancelled,
            });
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Err(Interrupted {
                operation: self.operation,
                cause: InterruptCause::TimedOut(limit),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum TestError {
        Interrupted(Interrupted),
    }

    impl From<Interrupted> for TestError {
        fn from(value: Interrupted) -> Self {
            Self::Interrupted(value)
        }
    }

    #[tokio::test]
    async fn completes_when_not_interrupted() {
        let control = CallControl::default();
        let result: Result<u32, TestError> = control.run("noop", async { Ok(7) }).await;
        assert!(matches!(result, Ok(7)));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let control = CallControl::new(token, None);
        let result: Result<(), TestError> = control
            .run("export", std::future::pending::<Result<(), TestError>>())
            .await;
        let Err(TestError::Interrupted(err)) = result else {
            panic!("expected interruption");
        };
        assert_eq!(err.cause, InterruptCause::Cancelled);
        assert_eq!(err.to_string(), "export cancelled");
    }

    #[tokio::test]
    async fn deadline_interrupts_hung_call() {
        let control = CallControl::new(CancellationToken::new(), Some(Duration::from_millis(20)));
        let result: Result<(), TestError> = control
            .run("upload", std::future::pending::<Result<(), TestError>>())
            .await;
        let Err(TestError::Interrupted(err)) = result else {
            panic!("expected timeout");
        };
        assert!(matches!(err.cause, InterruptCause::TimedOut(_)));
    }

    #[test]
    fn checkpoint_observes_cancellation_after_creation() {
        let control = CallControl::default();
        let checkpoint = control.checkpoint("compress");
        assert!(checkpoint.check().is_ok());

        control.token().cancel();
        let err = checkpoint.check().err();
        assert_eq!(err.map(|e| e.cause), Some(InterruptCause::Cancelled));
    }

    #[test]
    fn checkpoint_expires_at_deadline() {
        let control = CallControl::new(CancellationToken::new(), Some(Duration::ZERO));
        let err = control.checkpoint("decompress").check().err();
        assert!(matches!(err.map(|e| e.cause), Some(InterruptCause::TimedOut(_))));
    }
}
