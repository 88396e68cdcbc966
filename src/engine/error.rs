use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("resource {0} not found or not bookable")]
    NotFound(Ulid),
    #[error("requested time is outside available slot range")]
    OutOfRange,
    #[error("slot capacity reached ({capacity})")]
    CapacityExceeded { capacity: u32 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::OutOfRange => "out_of_range",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::Internal(_) => "internal",
        }
    }

    pub(super) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(super) fn lock_timeout() -> Self {
        EngineError::Internal("lock wait timed out".into())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockTimeout => EngineError::lock_timeout(),
            other => EngineError::Internal(other.to_string()),
        }
    }
}
