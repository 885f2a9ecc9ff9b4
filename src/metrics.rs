//! Metrics collection and export for object pools

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Snapshot of a pool's counters
///
/// # Examples
///
/// ```
/// use generic_objectpool::{FnFactory, ObjectPool, PoolConfig};
///
/// let pool = ObjectPool::new(FnFactory::new(|| 1), PoolConfig::default()).unwrap();
///
/// {
///     let _obj = pool.borrow().unwrap();
///     let metrics = pool.metrics();
///     assert_eq!(metrics.total_borrowed, 1);
///     assert_eq!(metrics.active_objects, 1);
/// }
/// assert_eq!(pool.metrics().idle_objects, 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolMetrics {
    /// Objects created by the factory
    pub total_created: u64,

    /// Objects destroyed by the pool
    pub total_destroyed: u64,

    /// Successful borrows
    pub total_borrowed: u64,

    /// Objects returned to the pool
    pub total_returned: u64,

    /// Idle objects removed by the evictor
    pub total_evicted: u64,

    /// Objects rejected by validation, activation or passivation
    pub validation_failures: u64,

    /// Borrows refused with `Exhausted`
    pub exhausted_events: u64,

    /// Borrows that gave up with `Timeout`
    pub timeouts: u64,

    /// Current borrowed objects
    pub active_objects: usize,

    /// Current idle objects
    pub idle_objects: usize,

    /// Objects or creation permits granted but not yet resolved
    pub in_flight: usize,

    /// Borrowers waiting in the allocation queue
    pub waiting_borrowers: usize,

    /// Active plus in-flight objects over capacity (0.0 when unbounded)
    pub utilization: f64,

    /// Configured capacity, if bounded
    pub max_capacity: Option<usize>,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("total_borrowed".to_string(), self.total_borrowed.to_string());
        metrics.insert("total_returned".to_string(), self.total_returned.to_string());
        metrics.insert("total_evicted".to_string(), self.total_evicted.to_string());
        metrics.insert("validation_failures".to_string(), self.validation_failures.to_string());
        metrics.insert("exhausted_events".to_string(), self.exhausted_events.to_string());
        metrics.insert("timeouts".to_string(), self.timeouts.to_string());
        metrics.insert("active_objects".to_string(), self.active_objects.to_string());
        metrics.insert("idle_objects".to_string(), self.idle_objects.to_string());
        metrics.insert("in_flight".to_string(), self.in_flight.to_string());
        metrics.insert("waiting_borrowers".to_string(), self.waiting_borrowers.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert(
            "max_capacity".to_string(),
            self.max_capacity.map_or_else(|| "unbounded".to_string(), |c| c.to_string()),
        );
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use generic_objectpool::{FnFactory, ObjectPool, PoolConfig};
    /// use std::collections::HashMap;
    ///
    /// let pool = ObjectPool::new(FnFactory::new(|| 0u8), PoolConfig::default()).unwrap();
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = pool.export_metrics_prometheus("my_pool", Some(&tags));
    /// assert!(output.contains("objectpool_objects_active"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        let gauges: [(&str, &str, String); 5] = [
            ("objectpool_objects_active", "Current borrowed objects", metrics.active_objects.to_string()),
            ("objectpool_objects_idle", "Current idle objects", metrics.idle_objects.to_string()),
            ("objectpool_objects_in_flight", "Objects being created or activated", metrics.in_flight.to_string()),
            ("objectpool_borrowers_waiting", "Borrowers waiting for an object", metrics.waiting_borrowers.to_string()),
            ("objectpool_utilization", "Pool utilization ratio", format!("{:.2}", metrics.utilization)),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} gauge");
            let _ = writeln!(output, "{name}{{{labels}}} {value}");
        }

        let counters: [(&str, &str, u64); 8] = [
            ("objectpool_objects_created_total", "Objects created", metrics.total_created),
            ("objectpool_objects_destroyed_total", "Objects destroyed", metrics.total_destroyed),
            ("objectpool_objects_borrowed_total", "Objects borrowed", metrics.total_borrowed),
            ("objectpool_objects_returned_total", "Objects returned", metrics.total_returned),
            ("objectpool_objects_evicted_total", "Idle objects evicted", metrics.total_evicted),
            ("objectpool_validation_failures_total", "Validation failures", metrics.validation_failures),
            ("objectpool_events_exhausted_total", "Borrows refused on exhaustion", metrics.exhausted_events),
            ("objectpool_events_timeout_total", "Borrows timed out", metrics.timeouts),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name}{{{labels}}} {value}");
        }

        output
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Point-in-time occupancy, read under the pool lock
#[derive(Debug, Clone, Copy)]
pub(crate) struct Occupancy {
    pub active: usize,
    pub idle: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub capacity: Option<usize>,
}

impl Occupancy {
    pub fn utilization(&self) -> f64 {
        match self.capacity {
            Some(capacity) => (self.active + self.in_flight) as f64 / capacity as f64,
            None => 0.0,
        }
    }
}

/// Internal metrics tracker
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub borrowed: AtomicU64,
    pub returned: AtomicU64,
    pub evicted: AtomicU64,
    pub validation_failures: AtomicU64,
    pub exhausted: AtomicU64,
    pub timeouts: AtomicU64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, occupancy: Occupancy) -> PoolMetrics {
        PoolMetrics {
            total_created: self.created.load(Ordering::Relaxed),
            total_destroyed: self.destroyed.load(Ordering::Relaxed),
            total_borrowed: self.borrowed.load(Ordering::Relaxed),
            total_returned: self.returned.load(Ordering::Relaxed),
            total_evicted: self.evicted.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            exhausted_events: self.exhausted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            active_objects: occupancy.active,
            idle_objects: occupancy.idle,
            in_flight: occupancy.in_flight,
            waiting_borrowers: occupancy.waiting,
            utilization: occupancy.utilization(),
            max_capacity: occupancy.capacity,
        }
    }
}
