//! Burst-Capture: a convergence-gated still burst orchestrator
//!
//! This library opens a rear-facing capture device, streams preview frames
//! until auto-exposure (and optionally white balance and focus) settles,
//! then captures a fixed-size burst of stills and persists them named by
//! capture wall-clock time. Devices sit behind traits, so the same
//! orchestrator runs against V4L2 hardware or a scripted mock.

pub mod config;
pub mod controller;
pub mod convergence;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod sink;
pub mod storage;
pub mod templates;
pub mod timestamp;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use config::{BurstConfig, ConfigError};
pub use controller::{BurstController, BurstMode, BurstState};
pub use convergence::ConvergencePolicy;
pub use device::{NodeAccess, V4l2Driver};
pub use error::{CaptureError, Result};
pub use orchestrator::{Collaborators, LoggingHost, Orchestrator, OrchestratorHandle};
pub use sink::SinkPolicy;
pub use storage::DirectoryStorage;
pub use traits::{ImageFormat, SessionOutcome};
