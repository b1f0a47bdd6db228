//! Convergence gate deciding when preview metadata is good enough to capture.

use serde::{Deserialize, Serialize};

use crate::traits::Frame;

/// Which 3A axes must be acceptable before a burst is triggered.
///
/// An axis the device does not report never blocks convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergencePolicy {
    /// Auto-exposure only.
    #[default]
    Exposure,
    /// Auto-exposure and auto-white-balance.
    ExposureWhiteBalance,
    /// Auto-exposure, auto-white-balance and autofocus.
    Full,
}

impl ConvergencePolicy {
    /// Whether `frame` satisfies this policy. Pure.
    pub const fn evaluate(self, frame: &Frame) -> bool {
        let exposure = frame.exposure.is_acceptable();
        match self {
            Self::Exposure => exposure,
            Self::ExposureWhiteBalance => exposure && frame.white_balance.is_acceptable(),
            Self::Full => {
                exposure && frame.white_balance.is_acceptable() && frame.focus.is_acceptable()
            }
        }
    }

    /// Short label for logs.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Exposure => "AE",
            Self::ExposureWhiteBalance => "AE+AWB",
            Self::Full => "3A",
        }
    }
}
