//! Error types for firmware update operations

use thiserror::Error;

/// Stable classification codes for [`UpdateError`] variants.
///
/// Callers that dispatch on failure family (retry on `Busy`, tear down on
/// `Aborted`) should match on the code rather than the full error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    /// Null/out-of-range parameter caught at the API boundary
    InvalidArgument,
    /// Wrong lifecycle state, or a handle that is not the active context
    FailedPrecondition,
    /// The non-blocking main-API lock could not be acquired
    Busy,
    /// Allocation failure or a backend-reported quota limit
    ResourceExhausted,
    /// A collaborator reported a transient/environmental failure
    Unavailable,
    /// Operation not supported for the given target
    Unimplemented,
    /// Content-level integrity failure
    InvalidData,
    /// Invariant violation; never expected in correct operation
    Internal,
    /// Data-path failure that forces the lifecycle into the Error state
    Aborted,
}

/// Errors that can occur during firmware update operations
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Invalid argument passed to an API entry point
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current lifecycle state
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Another main-API call is in progress; retry later
    #[error("busy: another operation holds the main API lock")]
    Busy,

    /// Allocation failure or backend quota limit
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Collaborator (memory manager, streaming block, slot control) failure
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Operation not supported for the given target
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Content-level integrity failure (header hash, image hash, arch version)
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Invariant violation / bug; returned cleanly rather than panicking
    #[error("internal error: {0}")]
    Internal(String),

    /// Data-path failure; the lifecycle is forced into the Error state and
    /// only Close is valid afterwards
    #[error("aborted: {cause}")]
    Aborted {
        /// The underlying failure that forced the abort
        #[source]
        cause: Box<UpdateError>,
    },
}

impl UpdateError {
    /// Wrap a failure as an abort, forcing the lifecycle into Error.
    pub fn aborted(cause: UpdateError) -> Self {
        UpdateError::Aborted {
            cause: Box::new(cause),
        }
    }

    /// Classification code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            UpdateError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            UpdateError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            UpdateError::Busy => ErrorCode::Busy,
            UpdateError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            UpdateError::Unavailable(_) => ErrorCode::Unavailable,
            UpdateError::Unimplemented(_) => ErrorCode::Unimplemented,
            UpdateError::InvalidData(_) => ErrorCode::InvalidData,
            UpdateError::Internal(_) => ErrorCode::Internal,
            UpdateError::Aborted { .. } => ErrorCode::Aborted,
        }
    }

    /// Classification code of the innermost cause.
    ///
    /// For an [`UpdateError::Aborted`] this unwraps the failure that forced
    /// the abort (e.g. `InvalidData` for a final image hash mismatch); for
    /// every other variant it equals [`UpdateError::code`].
    pub fn root_code(&self) -> ErrorCode {
        match self {
            UpdateError::Aborted { cause } => cause.root_code(),
            other => other.code(),
        }
    }

    /// Log severity appropriate for this error.
    pub fn severity(&self) -> tracing::Level {
        match self.code() {
            ErrorCode::Busy => tracing::Level::DEBUG,
            ErrorCode::InvalidArgument
            | ErrorCode::FailedPrecondition
            | ErrorCode::Unimplemented
            | ErrorCode::ResourceExhausted => tracing::Level::WARN,
            ErrorCode::Unavailable
            | ErrorCode::InvalidData
            | ErrorCode::Internal
            | ErrorCode::Aborted => tracing::Level::ERROR,
        }
    }
}

/// A specialized `Result` type for firmware update operations.
pub type UpdateResult<T = ()> = std::result::Result<T, UpdateError>;
