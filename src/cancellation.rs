//! Cooperative cancellation, one token threaded through every loop and
//! channel request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::structures::Error;

#[derive(Clone, Default)]
pub struct CancellationToken {
  inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
  cancelled: AtomicBool,
  notify: Notify,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.inner.cancelled.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// Bails out of the current loop iteration once cancellation is requested.
  pub fn check(&self) -> Result<(), Error> {
    if self.is_cancelled() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    loop {
      if self.is_cancelled() {
        return;
      }
      let notified = self.inner.notify.notified();
      tokio::pin!(notified);
      // The flag may have flipped between the check and registering the waiter.
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn check_fails_after_cancel() {
    let token = CancellationToken::new();
    assert!(token.check().is_ok());
    token.cancel();
    assert!(matches!(token.check(), Err(Error::Cancelled)));
    assert!(token.is_cancelled());
  }

  #[tokio::test]
  async fn cancelled_wakes_waiters() {
    let token = CancellationToken::new();
    let waiter = token.clone();
    let handle = tokio::spawn(async move { waiter.cancelled().await });
    token.cancel();
    handle.await.unwrap();
  }
}
