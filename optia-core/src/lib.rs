pub mod context;
pub mod page;

pub use context::{Caller, Role};
pub use page::PagedResult;

/// Error taxonomy shared by every layer of the order lifecycle engine.
///
/// Validation failures are detected before any mutation begins; persistence
/// faults roll back fully and surface here without store-level detail.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Order not found")]
    NotFound,

    #[error("Caller is not allowed to access this order")]
    Forbidden,

    #[error("Caller identity could not be determined")]
    Unauthenticated,

    #[error("Invalid status value: {0}. Valid states: 0-10")]
    InvalidStatus(i16),

    #[error("Only the next status is allowed. Current state: {current}, expected next: {expected}")]
    IllegalTransition { current: i16, expected: i16 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Status transition could not be applied")]
    TransitionFailed,

    #[error("Storage failure: {0}")]
    Persistence(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
