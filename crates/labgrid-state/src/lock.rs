//! The global resource table lock.
//!
//! Claim and release of global resources run under one exclusive lock so the
//! read-candidates/mark-locked step is serialized across every caller and
//! every resource type. The pieces:
//!
//! - [`Locker`]: an exclusive lock acquired with a bounded
//!   wait, returning a guard that releases on drop.
//! - [`TableLocker`]: the in-process implementation. Waiters are served in
//!   arrival order.
//! - [`LockContext`]: request-scoped reentrancy. A handler may acquire
//!   through the same context repeatedly; the underlying lock is taken on the
//!   first acquire and given back when the count returns to zero (or the
//!   context is dropped).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{LockError, LockResult};

/// An exclusive lock with a bounded wait.
pub trait Locker: Send + Sync {
    /// Held while the lock is owned; dropping it releases the lock.
    type Guard: Send;

    /// Wait up to `wait` for the lock. Fails with [`LockError::Timeout`].
    fn acquire(&self, wait: Duration) -> impl Future<Output = LockResult<Self::Guard>> + Send;
}

/// In-process table lock backed by a fair async mutex.
#[derive(Clone, Default)]
pub struct TableLocker {
    mutex: Arc<Mutex<()>>,
}

impl TableLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locker for TableLocker {
    type Guard = OwnedMutexGuard<()>;

    fn acquire(&self, wait: Duration) -> impl Future<Output = LockResult<Self::Guard>> + Send {
        let mutex = Arc::clone(&self.mutex);
        async move {
            match tokio::time::timeout(wait, mutex.lock_owned()).await {
                Ok(guard) => Ok(guard),
                Err(_) => {
                    warn!(?wait, "timed out waiting for resource table lock");
                    Err(LockError::Timeout(wait))
                }
            }
        }
    }
}

/// Request-scoped, reference-counted hold on a [`Locker`].
pub struct LockContext<'a, L: Locker> {
    locker: &'a L,
    wait: Duration,
    guard: Option<L::Guard>,
    depth: u32,
}

impl<'a, L: Locker> LockContext<'a, L> {
    pub fn new(locker: &'a L, wait: Duration) -> Self {
        Self {
            locker,
            wait,
            guard: None,
            depth: 0,
        }
    }

    /// Take the lock, or bump the count if this context already holds it.
    pub async fn acquire(&mut self) -> LockResult<()> {
        if self.depth == 0 {
            let guard = self.locker.acquire(self.wait).await?;
            self.guard = Some(guard);
            debug!("resource table lock acquired");
        }
        self.depth += 1;
        Ok(())
    }

    /// Drop one level. The lock is given back when the count reaches zero.
    pub fn release(&mut self) -> LockResult<()> {
        self.check_held()?;
        self.depth -= 1;
        if self.depth == 0 {
            self.guard = None;
            debug!("resource table lock released");
        }
        Ok(())
    }

    pub fn check_held(&self) -> LockResult<()> {
        if self.depth == 0 {
            return Err(LockError::NotHeld);
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn context_is_reentrant() {
        let locker = TableLocker::new();
        let mut ctx = LockContext::new(&locker, SHORT);

        ctx.acquire().await.unwrap();
        ctx.acquire().await.unwrap();
        assert_eq!(ctx.depth(), 2);

        ctx.release().unwrap();
        assert!(ctx.is_held());
        // Still held: another request cannot get in.
        let mut other = LockContext::new(&locker, SHORT);
        assert_eq!(other.acquire().await, Err(LockError::Timeout(SHORT)));

        ctx.release().unwrap();
        assert!(!ctx.is_held());
        other.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn release_without_acquire_fails() {
        let locker = TableLocker::new();
        let mut ctx = LockContext::new(&locker, SHORT);
        assert_eq!(ctx.release(), Err(LockError::NotHeld));
        assert_eq!(ctx.check_held(), Err(LockError::NotHeld));
    }

    #[tokio::test]
    async fn dropping_context_releases_lock() {
        let locker = TableLocker::new();
        {
            let mut ctx = LockContext::new(&locker, SHORT);
            ctx.acquire().await.unwrap();
            ctx.acquire().await.unwrap();
        }
        let mut ctx = LockContext::new(&locker, SHORT);
        ctx.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_holder_finishes() {
        let locker = TableLocker::new();
        let guard = locker.acquire(SHORT).await.unwrap();

        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.acquire(Duration::from_secs(5)).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let locker = TableLocker::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let guard = locker.acquire(SHORT).await.unwrap();

        let mut waiters = Vec::new();
        for name in ["a", "b", "c"] {
            let locker = locker.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let _guard = locker.acquire(Duration::from_secs(5)).await.unwrap();
                order.lock().unwrap().push(name);
            }));
            // Let this waiter enqueue before the next one is spawned.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(guard);

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
    }
}
