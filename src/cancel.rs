//! Linked cancellation (part of C7/C8's concurrency model, §4.7/§5).
//!
//! A thin wrapper over `tokio_util::sync::CancellationToken`. The token
//! itself already gives child-token propagation and guaranteed-on-drop
//! cleanup, which is exactly the "no perpetual wait handle" guarantee the
//! retry driver and the `Timeout` strategy need; this module exists so the
//! rest of the crate depends on `bulwark::cancel::CancelToken` rather than
//! reaching into `tokio_util` directly, and so a cheap no-op default is
//! available when neither a caller-supplied token nor a timeout is in play.

use tokio_util::sync::CancellationToken;

/// A cooperative cancellation signal, optionally linked to a parent.
///
/// Cloning shares the same underlying signal; [`Self::child_token`] creates
/// a token that is cancelled both when cancelled directly and when its
/// parent is cancelled, but whose own cancellation does not propagate
/// upward.
#[derive(Clone, Debug)]
pub struct CancelToken(CancellationToken);

impl CancelToken {
    /// A fresh, unlinked token.
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// A child token: cancelled when `self` is cancelled, independently
    /// cancellable on its own without affecting `self`.
    pub fn child_token(&self) -> Self {
        Self(self.0.child_token())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once this token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.0.cancelled().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
