use thiserror::Error;

pub type Result<T> = std::result::Result<T, DsError>;

/// Closed status-code set returned across the legacy API boundary.
///
/// The legacy API reports every failure as an `HRESULT`; this enum is the
/// Rust-side equivalent, with one variant per distinct legacy status the
/// compatibility layer can produce. Variants carry a short static reason where
/// the legacy code alone would be ambiguous in logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DsError {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The call is well-formed but not legal in the object's current state
    /// (e.g. relocating a playing voice, replacing notifications mid-play).
    #[error("invalid call: {0}")]
    InvalidCall(&'static str),

    #[error("unsupported or malformed wave format: {0}")]
    BadFormat(&'static str),

    /// Voice admission failed: every hardware and software slot on the device
    /// is in use. The buffer stays unassigned and the call may be retried once
    /// capacity frees up.
    #[error("all hardware and software voices are in use")]
    VoicesExhausted,

    #[error("object has not been initialized")]
    Uninitialized,

    #[error("object is already initialized")]
    AlreadyInitialized,

    /// Sticky loss condition on the primary playback path; cleared by an
    /// explicit restore once the cause of the loss is gone.
    #[error("buffer memory has been lost and must be restored")]
    BufferLost,

    /// The buffer was created without the capability flag this control
    /// requires.
    #[error("the requested control is not available on this buffer")]
    ControlUnavailable,

    #[error("the operation requires a higher cooperative level")]
    PriorityLevelNeeded,

    #[error("no audio driver for device: {0}")]
    NoDriver(String),

    #[error("audio backend failure: {0}")]
    Backend(String),

    #[error("generic failure")]
    Generic,
}

impl From<crate::backend::BackendError> for DsError {
    fn from(err: crate::backend::BackendError) -> Self {
        DsError::Backend(err.0)
    }
}
