//! # generic_objectpool
//!
//! Thread-safe pool of expensive-to-create objects (connections, buffers,
//! workers) recycled among concurrent borrowers.
//!
//! ## Features
//!
//! - Strict arrival-order fairness for blocked borrowers
//! - Fail, block (with optional timeout) or grow when exhausted
//! - LIFO or FIFO reuse of idle objects
//! - Validation on borrow, on return and while idle
//! - Background idle-object eviction with hard and soft idle limits
//! - Min-idle replenishment
//! - Automatic return of objects via RAII (Drop trait)
//! - Cancellable and async borrows
//! - Keyed pools with one sub-pool per key
//! - Health monitoring, metrics and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use generic_objectpool::{FnFactory, ObjectPool, PoolConfig};
//!
//! let pool = ObjectPool::new(FnFactory::new(|| Vec::<u8>::with_capacity(1024)), PoolConfig::default()).unwrap();
//! {
//!     let mut buf = pool.borrow().unwrap();
//!     buf.extend_from_slice(b"hello");
//!     // Object automatically returned when `buf` goes out of scope
//! }
//! assert_eq!(pool.num_idle(), 1);
//! ```

mod config;
mod errors;
mod eviction;
mod factory;
mod health;
mod idle;
mod keyed;
mod latch;
mod metrics;
mod pool;
mod scheduler;

pub use config::{ExhaustionPolicy, PoolConfig};
pub use errors::{PoolError, PoolResult};
pub use factory::{BoxError, FnFactory, ObjectFactory};
pub use health::HealthStatus;
pub use keyed::{KeyedFactory, KeyedObjectFactory, KeyedObjectPool, KeyedPooledObject};
pub use latch::CancelToken;
pub use metrics::{MetricsExporter, PoolMetrics};
pub use pool::{ObjectPool, PooledObject};
pub use scheduler::{ScheduleHandle, Scheduler, Task, ThreadScheduler, TokioScheduler};
