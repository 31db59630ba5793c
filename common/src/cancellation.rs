// Caller cancellation signals and the combined caller/timeout cancellation

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Actor recorded when no human requested the cancellation
pub const TIMEOUT_ACTOR: &str = "timeout";

/// CancelSignal is the caller's cooperative cancellation, carrying the
/// actor who requested it.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    requested_by: Arc<Mutex<Option<String>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel without naming an actor
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel on behalf of a user. The first named actor wins.
    pub fn cancel_by(&self, actor: impl Into<String>) {
        {
            let mut requested_by = self.requested_by.lock();
            if requested_by.is_none() {
                *requested_by = Some(actor.into());
            }
        }
        self.token.cancel();
    }

    /// Who requested cancellation, the timeout actor when nobody did
    pub fn requested_by(&self) -> String {
        self.requested_by
            .lock()
            .clone()
            .unwrap_or_else(|| TIMEOUT_ACTOR.to_string())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Why a combined cancellation fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    None,
    UserRequested { by: String },
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    Caller,
    Timeout,
}

/// CombinedCancellation fires when the caller cancels or the timeout
/// elapses, and remembers which of the two came first.
///
/// The countdown starts at construction, so create it only once the
/// operation it guards exists.
#[derive(Debug)]
pub struct CombinedCancellation {
    caller: CancelSignal,
    combined: CancellationToken,
    timeout_only: CancellationToken,
    timeout: Option<Duration>,
    cause: Arc<OnceLock<Cause>>,
    watcher: JoinHandle<()>,
}

impl CombinedCancellation {
    /// Start the timeout countdown linked to the caller's signal.
    /// `None` means no timeout.
    pub fn start(caller: &CancelSignal, timeout: Option<Duration>) -> Self {
        let timeout_only = CancellationToken::new();
        let combined = caller.token().child_token();
        let cause = Arc::new(OnceLock::new());

        let watcher = tokio::spawn({
            let caller_token = caller.token().clone();
            let timeout_only = timeout_only.clone();
            let combined = combined.clone();
            let cause = Arc::clone(&cause);
            async move {
                let countdown = async {
                    match timeout {
                        Some(duration) => tokio::time::sleep(duration).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = caller_token.cancelled() => {
                        let _ = cause.set(Cause::Caller);
                    }
                    _ = countdown => {
                        let _ = cause.set(Cause::Timeout);
                        timeout_only.cancel();
                        combined.cancel();
                    }
                }
            }
        });

        Self {
            caller: caller.clone(),
            combined,
            timeout_only,
            timeout,
            cause,
            watcher,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.combined
    }

    pub fn is_cancelled(&self) -> bool {
        self.combined.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.combined.cancelled().await
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn caller(&self) -> &CancelSignal {
        &self.caller
    }

    /// Which source fired, read after an interruption
    pub fn reason(&self) -> CancelReason {
        let cause = match self.cause.get() {
            Some(cause) => Some(*cause),
            None if self.timeout_only.is_cancelled() => Some(Cause::Timeout),
            None if self.caller.is_cancelled() => Some(Cause::Caller),
            None => None,
        };
        match cause {
            Some(Cause::Timeout) => CancelReason::TimedOut,
            Some(Cause::Caller) => CancelReason::UserRequested {
                by: self.caller.requested_by(),
            },
            None => CancelReason::None,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.reason() == CancelReason::TimedOut
    }
}

impl Drop for CombinedCancellation {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
