//! Clear-to-send credit: a counting signal capped at a small
//! maximum, used by the sending loop as a flow-control window.
//!
//! Built on [`tokio::sync::Notify`] rather than [`tokio::sync::Semaphore`]:
//! `Semaphore::add_permits` grows unboundedly, but `set()` here must
//! saturate at `max` (I4), which the stock semaphore doesn't express.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Default maximum outstanding credit (I4, max=10).
pub const DEFAULT_MAX: u32 = 10;

#[derive(Clone)]
pub struct Credit {
    inner: Arc<Inner>,
}

struct Inner {
    count: AtomicU32,
    max: u32,
    notify: Notify,
}

impl Credit {
    pub fn new(max: u32) -> Self {
        Self { inner: Arc::new(Inner { count: AtomicU32::new(0), max, notify: Notify::new() }) }
    }

    /// Grants one credit, saturating at `max`.
    pub fn set(&self) {
        let inner = &self.inner;
        let _ = inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_add(1).min(inner.max)));
        inner.notify.notify_one();
    }

    /// Consumes one credit, saturating at 0.
    pub fn clear(&self) {
        let _ = self.inner.count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            Some(c.saturating_sub(1))
        });
    }

    /// True iff no credit is currently available.
    pub fn blocked(&self) -> bool {
        self.inner.count.load(Ordering::Acquire) == 0
    }

    pub fn count(&self) -> u32 {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Blocks until credit is available, then consumes one unit.
    pub async fn wait(&self) {
        loop {
            if self
                .inner
                .count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                    if c > 0 { Some(c - 1) } else { None }
                })
                .is_ok()
            {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn saturates_at_max() {
        let c = Credit::new(2);
        c.set();
        c.set();
        c.set();
        assert_eq!(c.count(), 2);
    }

    #[test]
    fn clear_saturates_at_zero() {
        let c = Credit::new(10);
        c.clear();
        c.clear();
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn blocked_when_zero() {
        let c = Credit::new(10);
        assert!(c.blocked());
        c.set();
        assert!(!c.blocked());
    }

    #[tokio::test]
    async fn wait_consumes_one_unit() {
        let c = Credit::new(10);
        c.set();
        c.set();
        c.wait().await;
        assert_eq!(c.count(), 1);
    }

    #[tokio::test]
    async fn wait_blocks_until_set() {
        let c = Credit::new(10);
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move {
                c.wait().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        c.set();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should complete once credit is set")
            .unwrap();
    }
}
