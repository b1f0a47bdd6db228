//! Per-session cache of request descriptors.

use crate::error::Result;
use crate::traits::{AfMode, CaptureRequest, Device, NoiseReduction, OutputKind, Template};

/// Still-request settings applied once when the cache is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StillSettings {
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Produce stills from buffered preview data.
    pub zero_shutter_lag: bool,
}

/// Preview and still-capture descriptors built once after the device opens.
///
/// Only the session worker owns the cache, so descriptors are never
/// observed half-mutated while a submission is in flight.
#[derive(Debug, Clone)]
pub struct RequestTemplateCache {
    preview: CaptureRequest,
    still: CaptureRequest,
}

impl RequestTemplateCache {
    /// Build both descriptors from `device`.
    pub fn build(device: &mut dyn Device, settings: StillSettings) -> Result<Self> {
        let mut preview = device.create_request(Template::Preview)?;
        preview.add_target(OutputKind::Preview);
        preview.af_mode = AfMode::ContinuousPicture;

        let mut still = device.create_request(Template::StillCapture)?;
        still.add_target(OutputKind::Image);
        still.enable_zsl = settings.zero_shutter_lag;
        still.noise_reduction = NoiseReduction::Off;
        still.jpeg_quality = settings.jpeg_quality;

        Ok(Self { preview, still })
    }

    /// Repeating preview descriptor.
    pub const fn preview(&self) -> &CaptureRequest {
        &self.preview
    }

    /// Still-capture descriptor.
    pub const fn still(&self) -> &CaptureRequest {
        &self.still
    }

    #[cfg(test)]
    fn still_mut(&mut self) -> &mut CaptureRequest {
        &mut self.still
    }

    /// `count` copies of the still descriptor for one batch submission.
    pub fn still_batch(&self, count: u32) -> Vec<CaptureRequest> {
        (0..count).map(|_| self.still.clone()).collect()
    }
}
