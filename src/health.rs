//! Health monitoring for object pools

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::metrics::Occupancy;

/// Health status of an object pool
///
/// # Examples
///
/// ```
/// use generic_objectpool::{FnFactory, ObjectPool, PoolConfig};
///
/// let pool = ObjectPool::new(FnFactory::new(|| 0u8), PoolConfig::default()).unwrap();
///
/// let health = pool.health_status();
/// assert!(health.is_healthy());
/// assert_eq!(health.idle_objects, 0);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    /// Idle objects count
    pub idle_objects: usize,

    /// Borrowed objects count
    pub active_objects: usize,

    /// Borrowers waiting for an object
    pub waiting_borrowers: usize,

    /// Total capacity, if bounded
    pub total_capacity: Option<usize>,

    /// Whether the pool has been closed
    pub closed: bool,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    pub(crate) fn new(occupancy: Occupancy, closed: bool) -> Self {
        let utilization = occupancy.utilization();

        let mut warnings = Vec::new();
        let mut is_healthy = !closed;

        if closed {
            warnings.push("Pool is closed".to_string());
        }

        // Check for high utilization
        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        if occupancy.waiting > 0 {
            warnings.push(format!("{} borrower(s) waiting", occupancy.waiting));
            is_healthy = false;
        }

        if occupancy.idle == 0 && occupancy.active > 0 {
            warnings.push("No idle objects".to_string());
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            idle_objects: occupancy.idle,
            active_objects: occupancy.active,
            waiting_borrowers: occupancy.waiting,
            total_capacity: occupancy.capacity,
            closed,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
