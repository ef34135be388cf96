use thiserror::Error;

use apexfin_core::DomainError;

use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStoreError;

/// Error surfaced by the application services.
///
/// Domain failures pass through untouched; infrastructure failures are
/// wrapped. `TransientConflict` means the bounded optimistic-concurrency
/// retry loop was exhausted and the caller may try again.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("transient conflict: concurrent updates exhausted the retry budget")]
    TransientConflict,

    #[error("event deserialization failed: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        match value {
            // A concurrency error escaping a service means its retry loop
            // gave up.
            DispatchError::Concurrency(_) => ServiceError::TransientConflict,
            DispatchError::Domain(e) => ServiceError::Domain(e),
            DispatchError::Deserialize(msg) => ServiceError::Deserialize(msg),
            DispatchError::Store(e) => ServiceError::Store(e),
            DispatchError::Publish(msg) => ServiceError::Publish(msg),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
