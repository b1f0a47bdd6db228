//! Error taxonomy for capture sessions.

use thiserror::Error;

/// Error type for capture session operations.
///
/// Every variant except [`CaptureError::PersistenceFailed`] is fatal: it
/// ends the session in `Failed` and runs the standard teardown. Nothing is
/// retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The host refused capture authorization before startup.
    #[error("capture authorization denied")]
    AuthorizationDenied,
    /// No rear-facing device was listed by the device directory.
    #[error("no rear-facing capture device found")]
    NoDeviceFound,
    /// The driver could not open the selected device.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// The capture session could not be configured.
    #[error("session configuration failed: {0}")]
    SessionConfigFailed(String),
    /// The device went away mid-session.
    #[error("device disconnected")]
    DeviceDisconnected,
    /// The device reported an error code.
    #[error("device error {0}")]
    DeviceError(i32),
    /// A preview or capture request was rejected by the session.
    #[error("capture submission failed: {0}")]
    CaptureSubmitFailed(String),
    /// The overall session deadline elapsed.
    #[error("session deadline elapsed")]
    Timeout,
    /// The lifecycle host forced shutdown before the burst finished.
    #[error("teardown requested by host")]
    TeardownRequested,
    /// The session worker thread panicked.
    #[error("session worker panicked")]
    WorkerPanicked,
    /// An image could not be written. Recovered locally.
    #[error("failed to persist image: {0}")]
    PersistenceFailed(String),
}

impl CaptureError {
    /// Whether this error ends the session.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::PersistenceFailed(_))
    }
}

/// Result type for capture session operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
