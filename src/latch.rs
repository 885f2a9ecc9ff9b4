//! Per-borrow wait/notify handles

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::idle::IdleEntry;

/// What the allocator handed to a waiting borrow
#[derive(Debug)]
pub(crate) enum Grant<T> {
    /// An idle object, now in flight to the borrower
    Idle(IdleEntry<T>),
    /// Permission to create a new object
    Create,
}

/// Why [`Latch::wait`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Granted,
    Closed,
    Interrupted,
    TimedOut,
}

struct LatchState<T> {
    grant: Option<Grant<T>>,
    closed: bool,
    interrupted: bool,
}

/// One pending borrow request.
///
/// Only the allocator grants a latch, always while holding the pool lock;
/// the pool lock is therefore taken before a latch lock, never after.
pub(crate) struct Latch<T> {
    state: Mutex<LatchState<T>>,
    cond: Condvar,
}

impl<T> Latch<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LatchState {
                grant: None,
                closed: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn grant(&self, grant: Grant<T>) {
        let mut state = self.state.lock();
        debug_assert!(state.grant.is_none(), "latch granted twice");
        state.grant = Some(grant);
        self.cond.notify_one();
    }

    pub fn take(&self) -> Option<Grant<T>> {
        self.state.lock().grant.take()
    }

    pub fn is_granted(&self) -> bool {
        self.state.lock().grant.is_some()
    }

    /// Wake the borrower because the pool closed
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_one();
    }

    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.cond.notify_one();
    }

    /// Block until granted, closed, interrupted or past `deadline`
    pub fn wait(&self, deadline: Option<Instant>) -> Wake {
        let mut state = self.state.lock();
        loop {
            if state.grant.is_some() {
                return Wake::Granted;
            }
            if state.interrupted {
                return Wake::Interrupted;
            }
            if state.closed {
                return Wake::Closed;
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return if state.grant.is_some() {
                            Wake::Granted
                        } else {
                            Wake::TimedOut
                        };
                    }
                }
            }
        }
    }
}

trait Interruptible: Send + Sync {
    fn interrupt(&self);
}

impl<T: Send> Interruptible for Latch<T> {
    fn interrupt(&self) {
        Latch::interrupt(self)
    }
}

/// Latches currently blocked on a token, keyed by registration id
#[derive(Default)]
struct Waiters {
    next_id: u64,
    latches: Vec<(u64, Arc<dyn Interruptible>)>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waiters: Mutex<Waiters>,
}

/// Interrupts a blocked [`ObjectPool::borrow_with_cancel`] from another thread
///
/// One token may guard any number of borrows at once; cancelling it
/// interrupts all of them. A token is one-shot: once cancelled, every later
/// borrow using it is interrupted straight away.
///
/// # Examples
///
/// ```
/// use generic_objectpool::{CancelToken, FnFactory, ObjectPool, PoolConfig, PoolError};
/// use std::thread;
/// use std::time::Duration;
///
/// let pool = ObjectPool::new(FnFactory::new(|| 0u8), PoolConfig::new().with_max_active(1)).unwrap();
/// let held = pool.borrow().unwrap();
///
/// let token = CancelToken::new();
/// let waiter = {
///     let (pool, token) = (pool.clone(), token.clone());
///     thread::spawn(move || pool.borrow_with_cancel(&token).map(|_| ()))
/// };
/// thread::sleep(Duration::from_millis(20));
/// token.cancel();
///
/// assert!(matches!(waiter.join().unwrap(), Err(PoolError::Interrupted)));
/// drop(held);
/// ```
///
/// [`ObjectPool::borrow_with_cancel`]: crate::ObjectPool::borrow_with_cancel
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt every borrow currently waiting on this token
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        for (_, waiter) in &self.inner.waiters.lock().latches {
            waiter.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn register<T: Send + 'static>(&self, latch: Arc<Latch<T>>) -> Registration<'_> {
        let waiter: Arc<dyn Interruptible> = latch.clone();
        let id = {
            let mut waiters = self.inner.waiters.lock();
            let id = waiters.next_id;
            waiters.next_id += 1;
            waiters.latches.push((id, waiter));
            id
        };
        if self.is_cancelled() {
            latch.interrupt();
        }
        Registration { token: self, id }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Detaches a latch from its token when the borrow finishes
pub(crate) struct Registration<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.token
            .inner
            .waiters
            .lock()
            .latches
            .retain(|(id, _)| *id != self.id);
    }
}
