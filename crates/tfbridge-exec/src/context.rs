//! Cancellation and deadlines for tool invocations

use crate::error::ExecError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline, handed to every blocking verb.
///
/// Children share the parent's cancellation and may only tighten its deadline.
#[derive(Debug, Clone)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OpContext {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Derives a context cancelled together with `self`
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child whose deadline is the earlier of both
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(candidate, |d| d.min(candidate))),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) -> ExecError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ExecError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ExecError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ExecError::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let ctx = OpContext::with_timeout(Duration::from_secs(5));
        let err = ctx.done().await;
        assert!(matches!(err, ExecError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = OpContext::background();
        let child = parent.child();
        parent.cancel();

        assert!(child.is_cancelled());
        assert!(matches!(child.done().await, ExecError::Cancelled));
    }

    #[tokio::test]
    async fn test_child_deadline_is_tightened() {
        let parent = OpContext::with_timeout(Duration::from_secs(10));
        let child = parent.child_with_timeout(Duration::from_secs(3600));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.child_with_timeout(Duration::from_secs(1));
        assert!(tighter.deadline().unwrap() < parent.deadline().unwrap());
    }
}
