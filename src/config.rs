//! Pool configuration options

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::{PoolError, PoolResult};

/// What a borrow does when there is neither an idle object nor spare capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ExhaustionPolicy {
    /// Fail immediately with [`PoolError::Exhausted`]
    Fail,

    /// Wait for an object, bounded by `max_wait`
    #[default]
    Block,

    /// Create a new object regardless of `max_active`
    Grow,
}

impl FromStr for ExhaustionPolicy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "block" => Ok(Self::Block),
            "grow" => Ok(Self::Grow),
            other => Err(PoolError::InvalidConfig(format!(
                "exhaustion policy {other:?} not recognized"
            ))),
        }
    }
}

/// Numeric codes used by older pool configurations: 0 fail, 1 block, 2 grow
impl TryFrom<u8> for ExhaustionPolicy {
    type Error = PoolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Fail),
            1 => Ok(Self::Block),
            2 => Ok(Self::Grow),
            other => Err(PoolError::InvalidConfig(format!(
                "exhaustion policy code {other} not recognized"
            ))),
        }
    }
}

impl fmt::Display for ExhaustionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fail => "fail",
            Self::Block => "block",
            Self::Grow => "grow",
        })
    }
}

/// Configuration for object pool behavior
///
/// Durations and limits set to `None` or zero mean "unbounded" (or
/// "disabled" for the evictor settings). `max_idle` is the exception:
/// `Some(0)` keeps no idle objects at all.
///
/// # Examples
///
/// ```
/// use generic_objectpool::{ExhaustionPolicy, PoolConfig};
/// use std::time::Duration;
///
/// let config = PoolConfig::new()
///     .with_max_active(16)
///     .with_max_idle(4)
///     .with_exhaustion_policy(ExhaustionPolicy::Block)
///     .with_max_wait(Duration::from_millis(250));
///
/// assert_eq!(config.capacity(), Some(16));
/// assert_eq!(config.wait_bound(), Some(Duration::from_millis(250)));
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Cap on borrowed plus in-flight objects
    pub max_active: Option<usize>,

    /// Cap on idle objects; extra objects are destroyed on return
    pub max_idle: Option<usize>,

    /// Number of idle objects the evictor tries to keep around
    pub min_idle: usize,

    /// Longest time a blocking borrow waits
    pub max_wait: Option<Duration>,

    /// Behavior when the pool is exhausted
    pub exhaustion_policy: ExhaustionPolicy,

    /// Validate objects before handing them out
    pub test_on_borrow: bool,

    /// Validate objects when they are returned
    pub test_on_return: bool,

    /// Validate idle objects during eviction runs
    pub test_while_idle: bool,

    /// Period of the idle-object evictor
    pub eviction_interval: Option<Duration>,

    /// Idle age after which an object is always evicted
    pub min_evictable_idle: Option<Duration>,

    /// Idle age after which an object is evicted while more than `min_idle` remain
    pub soft_min_evictable_idle: Option<Duration>,

    /// Idle objects examined per eviction run; a negative `n` means `1/|n|` of them
    pub tests_per_eviction_run: i32,

    /// Hand out the most recently returned object first
    pub lifo: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: Some(8),
            max_idle: Some(8),
            min_idle: 0,
            max_wait: None,
            exhaustion_policy: ExhaustionPolicy::Block,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            eviction_interval: None,
            min_evictable_idle: Some(Duration::from_secs(30 * 60)),
            soft_min_evictable_idle: None,
            tests_per_eviction_run: 3,
            lifo: true,
        }
    }
}

fn non_zero(d: Option<Duration>) -> Option<Duration> {
    d.filter(|d| !d.is_zero())
}

impl PoolConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of active objects (0 = unbounded)
    pub fn with_max_active(mut self, count: usize) -> Self {
        self.max_active = Some(count);
        self
    }

    /// Remove the cap on active objects
    pub fn unbounded(mut self) -> Self {
        self.max_active = None;
        self
    }

    /// Set the maximum number of idle objects
    pub fn with_max_idle(mut self, count: usize) -> Self {
        self.max_idle = Some(count);
        self
    }

    /// Set the idle target for the evictor's replenishment pass
    pub fn with_min_idle(mut self, count: usize) -> Self {
        self.min_idle = count;
        self
    }

    /// Bound blocking borrows
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = Some(wait);
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }

    pub fn with_test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }

    pub fn with_test_on_return(mut self, enabled: bool) -> Self {
        self.test_on_return = enabled;
        self
    }

    pub fn with_test_while_idle(mut self, enabled: bool) -> Self {
        self.test_while_idle = enabled;
        self
    }

    /// Run the evictor every `interval`
    ///
    /// # Examples
    ///
    /// ```
    /// use generic_objectpool::PoolConfig;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfig::new()
    ///     .with_eviction_interval(Duration::from_secs(30))
    ///     .with_min_evictable_idle(Duration::from_secs(300))
    ///     .with_tests_per_eviction_run(-4);
    ///
    /// assert_eq!(config.eviction_period(), Some(Duration::from_secs(30)));
    /// ```
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = Some(interval);
        self
    }

    pub fn with_min_evictable_idle(mut self, idle: Duration) -> Self {
        self.min_evictable_idle = Some(idle);
        self
    }

    pub fn with_soft_min_evictable_idle(mut self, idle: Duration) -> Self {
        self.soft_min_evictable_idle = Some(idle);
        self
    }

    pub fn with_tests_per_eviction_run(mut self, tests: i32) -> Self {
        self.tests_per_eviction_run = tests;
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    /// Effective cap on active plus in-flight objects
    pub fn capacity(&self) -> Option<usize> {
        self.max_active.filter(|n| *n > 0)
    }

    /// Effective bound for a blocking borrow
    pub fn wait_bound(&self) -> Option<Duration> {
        non_zero(self.max_wait)
    }

    /// Effective evictor period; `None` keeps the evictor stopped
    pub fn eviction_period(&self) -> Option<Duration> {
        non_zero(self.eviction_interval)
    }

    pub(crate) fn hard_idle_limit(&self) -> Option<Duration> {
        non_zero(self.min_evictable_idle)
    }

    pub(crate) fn soft_idle_limit(&self) -> Option<Duration> {
        non_zero(self.soft_min_evictable_idle)
    }

    /// Check the configuration for contradictory settings
    pub fn validate(&self) -> PoolResult<()> {
        if let Some(max_idle) = self.max_idle
            && self.min_idle > max_idle
        {
            return Err(PoolError::InvalidConfig(format!(
                "min_idle ({}) exceeds max_idle ({max_idle})",
                self.min_idle
            )));
        }
        if self.eviction_period().is_some() && self.tests_per_eviction_run == 0 {
            return Err(PoolError::InvalidConfig(
                "tests_per_eviction_run must be non-zero while the evictor is enabled".into(),
            ));
        }
        Ok(())
    }
}
