//! Error taxonomy for the interception engine.
//!
//! Only two conditions are surfaced to the caller; everything else is
//! contained. Tap revocation by the OS is auto-healed inside the event
//! callback and never becomes an error, and a failed synthetic-event
//! construction is best-effort (logged, swallowed).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TapError {
    /// Accessibility permission has not been granted to this process.
    #[error("accessibility permission denied: {0}")]
    PermissionDenied(String),

    /// The event tap could not be created or its delivery thread did not
    /// come up. Recoverable: the caller may retry after the permission
    /// state changes.
    #[error("event tap creation failed: {0}")]
    TapCreateFailed(String),
}
