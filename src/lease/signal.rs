use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio_util::sync::CancellationToken;

/// Handed to a critical section so it can notice when it should stop.
///
/// The signal fires when the lease can no longer be kept alive or when the caller
/// cancels. Long-running callbacks should check it at safe points, or race their
/// work against [`LeaseSignal::cancelled`].
#[derive(Debug, Clone)]
pub struct LeaseSignal {
    token: CancellationToken,
    lost: Arc<AtomicBool>,
}

impl LeaseSignal {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once the critical section should stop, for any reason.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the lease has been lost. Work done after this point is unprotected.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
