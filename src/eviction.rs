//! Idle-object eviction and min-idle replenishment

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};
use crate::factory::ObjectFactory;
use crate::idle::Walk;
use crate::metrics::MetricsTracker;
use crate::pool::{Origin, Parked, PoolInner, PoolState, SlotGuard};

/// Thresholds an eviction pass applies, snapshotted per examined object
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvictionPolicy {
    hard_limit: Option<Duration>,
    soft_limit: Option<Duration>,
    min_idle: usize,
    test_while_idle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Evict,
    Keep,
    Test,
}

impl EvictionPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            hard_limit: config.hard_idle_limit(),
            soft_limit: config.soft_idle_limit(),
            min_idle: config.min_idle,
            test_while_idle: config.test_while_idle,
        }
    }

    /// `idle_remaining` counts the idle objects left with this one taken out.
    /// The soft limit only evicts while at least `min_idle` would remain.
    pub fn verdict(&self, idle_for: Duration, idle_remaining: usize) -> Verdict {
        if self.hard_limit.is_some_and(|limit| idle_for > limit) {
            return Verdict::Evict;
        }
        if self.soft_limit.is_some_and(|limit| idle_for > limit) && idle_remaining >= self.min_idle {
            return Verdict::Evict;
        }
        if self.test_while_idle {
            Verdict::Test
        } else {
            Verdict::Keep
        }
    }
}

impl<T> PoolState<T> {
    /// Objects one eviction pass examines
    fn tests_this_run(&self) -> usize {
        let idle = self.idle.len();
        let tests = self.config.tests_per_eviction_run;
        if tests >= 0 {
            (tests as usize).min(idle)
        } else {
            idle.div_ceil(tests.unsigned_abs() as usize)
        }
    }
}

impl<F: ObjectFactory> PoolInner<F> {
    /// Examine a slice of the idle store, resuming where the last pass
    /// stopped, and destroy what has idled too long or fails validation.
    pub(crate) fn evict(&self) -> PoolResult<()> {
        let (tests, walk) = {
            let state = self.state.lock();
            if state.is_closed() {
                return Err(PoolError::Closed);
            }
            (state.tests_this_run(), Walk::for_lifo(state.config.lifo))
        };

        for _ in 0..tests {
            let (mut entry, policy, remaining) = {
                let mut state = self.state.lock();
                let state = &mut *state;
                let Some(entry) = state.idle.take_at_cursor(&mut state.cursor, walk) else {
                    break;
                };
                state.num_in_flight += 1;
                (entry, EvictionPolicy::from_config(&state.config), state.idle.len())
            };
            let slot = SlotGuard::new(self, Origin::Reserved);

            let evict = match policy.verdict(entry.idle_for(), remaining) {
                Verdict::Evict => true,
                Verdict::Keep => false,
                Verdict::Test => !self.test_idle(&mut entry.value),
            };

            let survivor = if evict {
                self.destroy_quietly(entry.value);
                MetricsTracker::incr(&self.metrics.evicted);
                None
            } else {
                Some(entry)
            };

            slot.settle();
            let leftover = {
                let mut state = self.state.lock();
                let state = &mut *state;
                state.num_in_flight -= 1;
                let leftover = match survivor {
                    Some(entry) if state.is_closed() => Some(entry),
                    Some(entry) => {
                        state.idle.restore_at_cursor(&state.cursor, walk, entry);
                        None
                    }
                    None => None,
                };
                state.allocate();
                leftover
            };
            if let Some(entry) = leftover {
                self.destroy_quietly(entry.value);
            }
        }
        Ok(())
    }

    /// Activate, validate and passivate an idle object; false means evict it
    fn test_idle(&self, value: &mut F::Object) -> bool {
        let passed = match self.factory.activate(value) {
            Err(e) => {
                tracing::debug!(error = %e, "idle object failed activation");
                false
            }
            Ok(()) if !self.factory.validate(value) => false,
            Ok(()) => match self.factory.passivate(value) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "idle object failed passivation");
                    false
                }
            },
        };
        if !passed {
            MetricsTracker::incr(&self.metrics.validation_failures);
        }
        passed
    }

    /// Create idle objects until `min_idle` is met or capacity runs out.
    /// Each creation holds an in-flight slot so concurrent borrows cannot
    /// push the pool past capacity meanwhile.
    pub(crate) fn ensure_min_idle(&self) -> PoolResult<()> {
        let deficit = {
            let state = self.state.lock();
            if state.is_closed() {
                return Err(PoolError::Closed);
            }
            state.idle_deficit()
        };

        // borrowers may drain what gets parked, so stop at the starting deficit
        for _ in 0..deficit {
            {
                let mut state = self.state.lock();
                if state.is_closed() {
                    return Err(PoolError::Closed);
                }
                if state.idle_deficit() == 0 {
                    return Ok(());
                }
                state.num_in_flight += 1;
            }
            if self.create_reserved()? != Parked::Idle {
                return Ok(());
            }
        }
        Ok(())
    }

    /// One evictor tick: an eviction pass followed by replenishment.
    /// Failures are logged and never end the schedule.
    pub(crate) fn run_eviction_tick(&self) {
        if self.state.lock().config.eviction_period().is_none() {
            return;
        }

        contained("eviction", || self.evict());
        contained("replenishment", || self.ensure_min_idle());
    }
}

fn contained(pass: &str, run: impl FnOnce() -> PoolResult<()>) {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) | Ok(Err(PoolError::Closed)) => {}
        Ok(Err(e)) => tracing::debug!(pass, error = %e, "evictor pass failed"),
        Err(payload) => tracing::error!(
            pass,
            panic = panic_message(payload.as_ref()),
            "evictor pass panicked"
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
