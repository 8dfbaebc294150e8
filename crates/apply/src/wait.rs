use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a bounded wait gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScopeEnded {
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Cancelled,
}

/// Deadline plus cancellation signal handed to every blocking call.
///
/// Children never outlive their parent: the deadline is the earlier of the two
/// and cancelling the parent token cancels every child.
#[derive(Debug, Clone)]
pub struct WaitScope {
    deadline: Instant,
    token: CancellationToken,
}

impl WaitScope {
    pub fn new(timeout: Duration) -> Self {
        Self::with_token(timeout, CancellationToken::new())
    }

    pub fn with_token(timeout: Duration, token: CancellationToken) -> Self {
        Self { deadline: Instant::now() + timeout, token }
    }

    pub fn child(&self, timeout: Duration) -> Self {
        let deadline = (Instant::now() + timeout).min(self.deadline);
        Self { deadline, token: self.token.child_token() }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Drive `fut` until it completes or the scope ends, whichever comes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ScopeEnded> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ScopeEnded::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(ScopeEnded::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}
