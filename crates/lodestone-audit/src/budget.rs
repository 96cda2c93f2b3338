//! Reactive concurrency budget for audit tasks.
//!
//! Each live audit owns one [`TaskBudget`] capping its concurrently
//! executing storage-server tasks. A scheduler waits while the budget is
//! zero, takes one unit to issue a task, and the unit returns when the
//! task settles.
//!
//! Invariant: `0 <= available <= max` at all times.

use std::sync::Arc;

use tokio::sync::Notify;

struct BudgetInner {
    available: std::sync::Mutex<usize>,
    changed: Notify,
    max: usize,
}

/// Shared, awaitable task budget.
#[derive(Clone)]
pub struct TaskBudget {
    inner: Arc<BudgetInner>,
}

impl TaskBudget {
    /// Creates a budget with `max` units available.
    ///
    /// # Panics
    ///
    /// Panics if `max` is zero.
    pub fn new(max: usize) -> Self {
        assert!(max > 0, "budget must admit at least one task");
        Self {
            inner: Arc::new(BudgetInner {
                available: std::sync::Mutex::new(max),
                changed: Notify::new(),
                max,
            }),
        }
    }

    /// Takes one unit, waiting while none are available.
    pub async fn acquire(&self) -> BudgetGuard {
        loop {
            // Register for wakeup before re-checking, so a release between
            // the check and the await is not missed.
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut available = self.inner.available.lock().expect("budget poisoned");
                if *available > 0 {
                    *available -= 1;
                    return BudgetGuard {
                        inner: self.inner.clone(),
                    };
                }
            }
            notified.await;
        }
    }

    /// Units currently available.
    pub fn available(&self) -> usize {
        *self.inner.available.lock().expect("budget poisoned")
    }

    /// Configured ceiling.
    pub fn max(&self) -> usize {
        self.inner.max
    }
}

/// One unit of budget; returning it wakes a waiting scheduler.
pub struct BudgetGuard {
    inner: Arc<BudgetInner>,
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        let mut available = self.inner.available.lock().expect("budget poisoned");
        *available += 1;
        debug_assert!(*available <= self.inner.max);
        drop(available);
        self.inner.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TaskBudget;

    #[tokio::test]
    async fn budget_never_exceeds_bounds() {
        let budget = TaskBudget::new(2);
        assert_eq!(budget.available(), 2);

        let g1 = budget.acquire().await;
        let g2 = budget.acquire().await;
        assert_eq!(budget.available(), 0);

        drop(g1);
        assert_eq!(budget.available(), 1);
        drop(g2);
        assert_eq!(budget.available(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let budget = TaskBudget::new(1);
        let guard = budget.acquire().await;

        let waiter = {
            let budget = budget.clone();
            tokio::spawn(async move {
                let _g = budget.acquire().await;
            })
        };

        // The waiter cannot proceed while the unit is held.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(budget.available(), 1);
    }
}
