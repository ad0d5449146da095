use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use tracing::{debug, info, warn};

use crate::handshake::Attach;
use crate::invoker::{HandlerInvoker, SpawnAndWait};
use crate::types::ConnectionContext;

use super::{DISPATCH_TARGET, DispatchStrategy};

/// Counting semaphore bounding concurrently live handler threads.
#[derive(Debug)]
pub struct ThreadBudget {
    live: Mutex<usize>,
    freed: Condvar,
    max: usize,
}

impl ThreadBudget {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(ThreadBudget {
            live: Mutex::new(0),
            freed: Condvar::new(),
            max: max.max(1),
        })
    }

    /// Takes a slot, blocking while the ceiling is reached.
    pub fn acquire(self: &Arc<Self>) -> ThreadPermit {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if *live >= self.max {
            debug!(target: DISPATCH_TARGET, max = self.max, "thread ceiling reached, waiting");
        }
        while *live >= self.max {
            live = self.freed.wait(live).unwrap_or_else(PoisonError::into_inner);
        }
        *live += 1;
        ThreadPermit { budget: Arc::clone(self) }
    }

    /// Number of slots currently held.
    pub fn live(&self) -> usize {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max(&self) -> usize { self.max }

    fn release(&self) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        *live = live.saturating_sub(1);
        self.freed.notify_one();
    }
}

/// A held slot; released on drop.
#[derive(Debug)]
pub struct ThreadPermit {
    budget: Arc<ThreadBudget>,
}

impl Drop for ThreadPermit {
    fn drop(&mut self) {
        self.budget.release();
    }
}

/// One thread per connection inside the daemon.
///
/// Process image replacement would take the whole daemon down, so each
/// thread launches the handler as a subprocess and waits for it.
pub struct ThreadDispatch {
    invoker: Arc<HandlerInvoker<SpawnAndWait>>,
    budget: Arc<ThreadBudget>,
}

impl ThreadDispatch {
    pub fn new(attach: Option<Arc<dyn Attach>>, max_threads: usize) -> Self {
        ThreadDispatch {
            invoker: Arc::new(HandlerInvoker::new(attach, SpawnAndWait)),
            budget: ThreadBudget::new(max_threads),
        }
    }

    pub fn budget(&self) -> &Arc<ThreadBudget> { &self.budget }
}

impl DispatchStrategy for ThreadDispatch {
    fn dispatch(&self, conn: ConnectionContext) {
        let peer = conn.peer();
        let permit = self.budget.acquire();
        let invoker = Arc::clone(&self.invoker);

        let spawned = thread::Builder::new()
            .name(format!("conn-{peer}"))
            .spawn(move || {
                let _permit = permit;
                match invoker.invoke(conn) {
                    Ok(status) => {
                        info!(target: DISPATCH_TARGET, %peer, %status, "handler exited");
                    }
                    Err(error) => {
                        warn!(target: DISPATCH_TARGET, %peer, %error, "connection dropped");
                    }
                }
            });

        // On failure the closure, socket and permit included, is dropped.
        if let Err(error) = spawned {
            warn!(target: DISPATCH_TARGET, %peer, %error, "thread spawn failed, dropping connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn budget_counts_permits() {
        let budget = ThreadBudget::new(2);
        let first = budget.acquire();
        let second = budget.acquire();
        assert_eq!(budget.live(), 2);
        drop(first);
        assert_eq!(budget.live(), 1);
        drop(second);
        assert_eq!(budget.live(), 0);
    }

    #[test]
    fn budget_blocks_at_the_ceiling() {
        let budget = ThreadBudget::new(1);
        let held = budget.acquire();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let budget = Arc::clone(&budget);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _permit = budget.acquire();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst), "second acquire must wait");

        drop(held);
        waiter.join().expect("waiter thread");
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(budget.live(), 0);
    }

    #[test]
    fn zero_ceiling_is_raised_to_one() {
        assert_eq!(ThreadBudget::new(0).max(), 1);
    }
}
