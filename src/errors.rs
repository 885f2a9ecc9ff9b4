//! Error types for the object pool

use std::time::Duration;

use thiserror::Error;

use crate::factory::BoxError;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool exhausted - no idle object and no capacity to create one")]
    Exhausted,

    #[error("Timed out after {0:?} waiting for an idle object")]
    Timeout(Duration),

    #[error("Pool is closed")]
    Closed,

    #[error("Factory could not create a new object")]
    CreateFailed(#[source] BoxError),

    #[error("Could not activate or validate a newly created object")]
    ValidationFailed(#[source] BoxError),

    #[error("Factory could not destroy the object")]
    DestroyFailed(#[source] BoxError),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Borrow was interrupted while waiting")]
    Interrupted,
}

impl PoolError {
    /// Whether the error came out of a factory callback
    pub fn is_factory_error(&self) -> bool {
        matches!(
            self,
            Self::CreateFailed(_) | Self::ValidationFailed(_) | Self::DestroyFailed(_)
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
