//! Lifecycle callbacks for pooled objects

use std::fmt;

/// Error type returned by factory callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Creates, checks and destroys the objects held by an [`ObjectPool`].
///
/// The factory may be called from many threads at once, but the pool never
/// hands the same object to two callbacks concurrently, and never calls a
/// callback while holding its own lock. Callbacks are therefore free to
/// block or to call back into the pool.
///
/// Only [`create`](ObjectFactory::create) is required; the other callbacks
/// default to no-ops that accept every object.
///
/// # Examples
///
/// ```
/// use generic_objectpool::{BoxError, ObjectFactory};
///
/// struct Buffers;
///
/// impl ObjectFactory for Buffers {
///     type Object = Vec<u8>;
///
///     fn create(&self) -> Result<Vec<u8>, BoxError> {
///         Ok(Vec::with_capacity(4096))
///     }
///
///     fn passivate(&self, buf: &mut Vec<u8>) -> Result<(), BoxError> {
///         buf.clear();
///         Ok(())
///     }
/// }
/// ```
///
/// [`ObjectPool`]: crate::ObjectPool
pub trait ObjectFactory: Send + Sync + 'static {
    /// Type of the pooled objects
    type Object: Send + 'static;

    /// Create a new object
    fn create(&self) -> Result<Self::Object, BoxError>;

    /// Destroy an object that is leaving the pool for good
    fn destroy(&self, _obj: Self::Object) -> Result<(), BoxError> {
        Ok(())
    }

    /// Check whether an object is still usable. `false` drops it.
    fn validate(&self, _obj: &Self::Object) -> bool {
        true
    }

    /// Prepare an idle object to be handed out
    fn activate(&self, _obj: &mut Self::Object) -> Result<(), BoxError> {
        Ok(())
    }

    /// Put a returned object back into its idle state
    fn passivate(&self, _obj: &mut Self::Object) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Factory built from a plain constructor function
///
/// # Examples
///
/// ```
/// use generic_objectpool::{FnFactory, ObjectPool, PoolConfig};
///
/// let factory = FnFactory::new(String::new).with_validation(|s: &String| s.len() < 1024);
/// let pool = ObjectPool::new(factory, PoolConfig::default()).unwrap();
///
/// let mut s = pool.borrow().unwrap();
/// s.push_str("hello");
/// ```
pub struct FnFactory<F, T> {
    create: F,
    validate: Option<fn(&T) -> bool>,
}

impl<F, T> FnFactory<F, T>
where
    F: Fn() -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    pub fn new(create: F) -> Self {
        Self {
            create,
            validate: None,
        }
    }

    /// Attach a validation function
    pub fn with_validation(mut self, validate: fn(&T) -> bool) -> Self {
        self.validate = Some(validate);
        self
    }
}

impl<F, T> fmt::Debug for FnFactory<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFactory")
            .field("validates", &self.validate.is_some())
            .finish()
    }
}

impl<F, T> ObjectFactory for FnFactory<F, T>
where
    F: Fn() -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    type Object = T;

    fn create(&self) -> Result<T, BoxError> {
        Ok((self.create)())
    }

    fn validate(&self, obj: &T) -> bool {
        self.validate.is_none_or(|validate| validate(obj))
    }
}
