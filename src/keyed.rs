//! Keyed object pools: one independent sub-pool per key

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::PoolConfig;
use crate::errors::{PoolError, PoolResult};
use crate::factory::{BoxError, ObjectFactory};
use crate::latch::CancelToken;
use crate::metrics::PoolMetrics;
use crate::pool::{ObjectPool, PooledObject};
use crate::scheduler::{Scheduler, ThreadScheduler};

/// Lifecycle callbacks for objects that belong to a key
///
/// Same contract as [`ObjectFactory`], with the key of the sub-pool passed
/// to every callback.
pub trait KeyedObjectFactory<K>: Send + Sync + 'static {
    type Object: Send + 'static;

    fn create(&self, key: &K) -> Result<Self::Object, BoxError>;

    fn destroy(&self, _key: &K, _obj: Self::Object) -> Result<(), BoxError> {
        Ok(())
    }

    fn validate(&self, _key: &K, _obj: &Self::Object) -> bool {
        true
    }

    fn activate(&self, _key: &K, _obj: &mut Self::Object) -> Result<(), BoxError> {
        Ok(())
    }

    fn passivate(&self, _key: &K, _obj: &mut Self::Object) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Binds a [`KeyedObjectFactory`] to one key so a plain [`ObjectPool`] can
/// drive it
pub struct KeyedFactory<K, F> {
    key: K,
    factory: Arc<F>,
}

impl<K, F> KeyedFactory<K, F> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K, F> ObjectFactory for KeyedFactory<K, F>
where
    K: Send + Sync + 'static,
    F: KeyedObjectFactory<K>,
{
    type Object = F::Object;

    fn create(&self) -> Result<Self::Object, BoxError> {
        self.factory.create(&self.key)
    }

    fn destroy(&self, obj: Self::Object) -> Result<(), BoxError> {
        self.factory.destroy(&self.key, obj)
    }

    fn validate(&self, obj: &Self::Object) -> bool {
        self.factory.validate(&self.key, obj)
    }

    fn activate(&self, obj: &mut Self::Object) -> Result<(), BoxError> {
        self.factory.activate(&self.key, obj)
    }

    fn passivate(&self, obj: &mut Self::Object) -> Result<(), BoxError> {
        self.factory.passivate(&self.key, obj)
    }
}

/// Object borrowed from a [`KeyedObjectPool`]
pub type KeyedPooledObject<K, F> = PooledObject<KeyedFactory<K, F>>;

/// A set of object pools sharing one configuration, one per key
///
/// Sub-pools are created on first use. Capacity and idle limits apply per key.
///
/// # Examples
///
/// ```
/// use generic_objectpool::{BoxError, KeyedObjectFactory, KeyedObjectPool, PoolConfig};
///
/// struct Connections;
///
/// impl KeyedObjectFactory<String> for Connections {
///     type Object = String;
///
///     fn create(&self, host: &String) -> Result<String, BoxError> {
///         Ok(format!("connection to {host}"))
///     }
/// }
///
/// let pool = KeyedObjectPool::new(Connections, PoolConfig::default()).unwrap();
/// let conn = pool.borrow(&"db-1".to_string()).unwrap();
/// assert_eq!(*conn, "connection to db-1");
/// drop(conn);
/// assert_eq!(pool.num_idle_total(), 1);
/// ```
pub struct KeyedObjectPool<K, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: KeyedObjectFactory<K>,
{
    pools: DashMap<K, ObjectPool<KeyedFactory<K, F>>>,
    factory: Arc<F>,
    config: RwLock<PoolConfig>,
    scheduler: Arc<dyn Scheduler>,
    closed: AtomicBool,
}

impl<K, F> KeyedObjectPool<K, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: KeyedObjectFactory<K>,
{
    pub fn new(factory: F, config: PoolConfig) -> PoolResult<Self> {
        Self::with_scheduler(factory, config, Arc::new(ThreadScheduler::new()))
    }

    /// All sub-pools schedule their evictors on `scheduler`
    pub fn with_scheduler(
        factory: F,
        config: PoolConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> PoolResult<Self> {
        config.validate()?;
        Ok(Self {
            pools: DashMap::new(),
            factory: Arc::new(factory),
            config: RwLock::new(config),
            scheduler,
            closed: AtomicBool::new(false),
        })
    }

    /// Handle to the sub-pool for `key`, creating it if needed
    pub fn pool(&self, key: &K) -> PoolResult<ObjectPool<KeyedFactory<K, F>>> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if let Some(pool) = self.pools.get(key) {
            return Ok(pool.clone());
        }

        let pool = self
            .pools
            .entry(key.clone())
            .or_try_insert_with(|| {
                tracing::debug!("creating sub-pool for new key");
                ObjectPool::with_scheduler(
                    KeyedFactory {
                        key: key.clone(),
                        factory: Arc::clone(&self.factory),
                    },
                    self.config.read().clone(),
                    Arc::clone(&self.scheduler),
                )
            })?
            .clone();

        // lost a race with close()
        if self.is_closed() {
            pool.close();
            return Err(PoolError::Closed);
        }
        Ok(pool)
    }

    /// Borrow an object for `key`; see [`ObjectPool::borrow`]
    pub fn borrow(&self, key: &K) -> PoolResult<KeyedPooledObject<K, F>> {
        self.pool(key)?.borrow()
    }

    pub fn borrow_with_cancel(
        &self,
        key: &K,
        token: &CancelToken,
    ) -> PoolResult<KeyedPooledObject<K, F>> {
        self.pool(key)?.borrow_with_cancel(token)
    }

    /// Create one idle object for `key`
    pub fn add_object(&self, key: &K) -> PoolResult<()> {
        self.pool(key)?.add_object()
    }

    pub fn num_active(&self, key: &K) -> usize {
        self.pools.get(key).map_or(0, |pool| pool.num_active())
    }

    pub fn num_idle(&self, key: &K) -> usize {
        self.pools.get(key).map_or(0, |pool| pool.num_idle())
    }

    pub fn num_active_total(&self) -> usize {
        self.pools.iter().map(|pool| pool.num_active()).sum()
    }

    pub fn num_idle_total(&self) -> usize {
        self.pools.iter().map(|pool| pool.num_idle()).sum()
    }

    /// Keys that currently have a sub-pool
    pub fn keys(&self) -> Vec<K> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn metrics(&self, key: &K) -> Option<PoolMetrics> {
        self.pools.get(key).map(|pool| pool.metrics())
    }

    /// Destroy the idle objects of one key
    pub fn clear_key(&self, key: &K) {
        let pool = self.pools.get(key).map(|pool| pool.clone());
        if let Some(pool) = pool {
            pool.clear();
        }
    }

    /// Destroy the idle objects of every key
    pub fn clear(&self) {
        for pool in self.handles() {
            pool.clear();
        }
    }

    /// Close every sub-pool; later borrows fail with [`PoolError::Closed`]
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for pool in self.handles() {
            pool.close();
        }
        tracing::debug!(keys = self.pools.len(), "keyed pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Replace the configuration of every current and future sub-pool
    pub fn set_config(&self, config: PoolConfig) -> PoolResult<()> {
        config.validate()?;
        *self.config.write() = config.clone();
        for pool in self.handles() {
            pool.set_config(config.clone())?;
        }
        Ok(())
    }

    pub fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    // Clone the handles out so no map shard stays locked during factory calls
    fn handles(&self) -> Vec<ObjectPool<KeyedFactory<K, F>>> {
        self.pools.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl<K, F> fmt::Debug for KeyedObjectPool<K, F>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    F: KeyedObjectFactory<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedObjectPool")
            .field("keys", &self.keys())
            .field("closed", &self.is_closed())
            .finish()
    }
}
