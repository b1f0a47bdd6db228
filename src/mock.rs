//! Scripted device driver for testing without hardware.
//!
//! The mock delivers every callback synchronously into the worker's
//! channel. Preview frames for a repeating request are all queued when the
//! request starts, so frames queued behind a `stop_repeating` behave like
//! frames that were already in flight on a real device.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{CaptureError, Result};
use crate::traits::{
    Authorization, CaptureRequest, Device, DeviceDescriptor, DeviceDirectory, DeviceDriver,
    DeviceEvent, EventSender, ExposureState, Facing, FocusState, Frame, Image, ImageBuffer,
    ImageFormat, LifecycleHost, OutputTarget, Session, SessionOutcome, Size, Storage, Template,
    WhiteBalanceState,
};

/// First sequence number used for still captures.
pub const CAPTURE_SEQUENCE_BASE: u64 = 1000;

/// Nanoseconds between consecutive mock frames (~30fps).
const FRAME_INTERVAL_NS: i64 = 33_000_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behaviour of a mock driver and everything it opens.
#[derive(Debug, Clone)]
pub struct Script {
    /// Devices listed by the directory.
    pub devices: Vec<DeviceDescriptor>,
    /// Deliver `OpenFailed` instead of `Opened`.
    pub fail_open: bool,
    /// `create_request` returns an error.
    pub fail_create_request: bool,
    /// Deliver `ConfigureFailed` instead of `SessionConfigured`.
    pub fail_configure: bool,
    /// Exposure state of each preview frame, in order.
    pub preview_exposure: Vec<ExposureState>,
    /// Deliver `Disconnected` in place of this preview frame index.
    pub disconnect_after: Option<usize>,
    /// One-based order in which a batch's captures complete.
    pub completion_order: Option<Vec<usize>>,
    /// Deliver every capture completion twice.
    pub duplicate_completions: bool,
    /// Attach images to capture results instead of separate image events.
    pub images_with_results: bool,
    /// Sessions report abort support.
    pub supports_abort: bool,
    /// `submit` and `submit_batch` return an error.
    pub fail_submit: bool,
    /// Accept submissions but never complete them.
    pub drop_captures: bool,
    /// Sizes reported for the image format.
    pub output_sizes: Vec<Size>,
}

impl Default for Script {
    fn default() -> Self {
        let mut preview_exposure = vec![ExposureState::Searching; 2];
        preview_exposure.extend([ExposureState::Converged; 10]);
        Self {
            devices: vec![
                DeviceDescriptor {
                    id: "0".to_owned(),
                    facing: Facing::Front,
                },
                DeviceDescriptor {
                    id: "1".to_owned(),
                    facing: Facing::Back,
                },
            ],
            fail_open: false,
            fail_create_request: false,
            fail_configure: false,
            preview_exposure,
            disconnect_after: None,
            completion_order: None,
            duplicate_completions: false,
            images_with_results: false,
            supports_abort: true,
            fail_submit: false,
            drop_captures: false,
            output_sizes: vec![Size::new(1920, 1080), Size::new(4032, 3024)],
        }
    }
}

/// Ordered record of driver calls.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    fn record<S: Into<String>>(&self, entry: S) {
        lock(&self.entries).push(entry.into());
    }

    /// Every call so far.
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Number of calls named `name`.
    pub fn count(&self, name: &str) -> usize {
        lock(&self.entries).iter().filter(|entry| *entry == name).count()
    }

    /// Index of the first call named `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|entry| entry == name)
    }
}

#[derive(Debug)]
struct Shared {
    script: Script,
    journal: Journal,
    released: Arc<AtomicUsize>,
    outputs: Mutex<Vec<OutputTarget>>,
    preview_sequence: AtomicU64,
    capture_sequence: AtomicU64,
}

/// Scripted driver. Clones share the same journal and counters.
#[derive(Debug, Clone)]
pub struct MockDriver {
    shared: Arc<Shared>,
}

impl MockDriver {
    /// Create a driver that follows `script`.
    pub fn new(script: Script) -> Self {
        Self {
            shared: Arc::new(Shared {
                script,
                journal: Journal::default(),
                released: Arc::new(AtomicUsize::new(0)),
                outputs: Mutex::new(Vec::new()),
                preview_sequence: AtomicU64::new(1),
                capture_sequence: AtomicU64::new(CAPTURE_SEQUENCE_BASE),
            }),
        }
    }

    /// Directory listing the scripted devices.
    pub fn directory(&self) -> MockDirectory {
        MockDirectory {
            devices: self.shared.script.devices.clone(),
        }
    }

    /// Call journal shared by every device and session.
    pub fn journal(&self) -> Journal {
        self.shared.journal.clone()
    }

    /// Image buffers released so far.
    pub fn released(&self) -> usize {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Outputs of the last configured session.
    pub fn outputs(&self) -> Vec<OutputTarget> {
        lock(&self.shared.outputs).clone()
    }

    /// A device whose callbacks go nowhere, for exercising it directly.
    pub fn detached_device(&self) -> MockDevice {
        let (tx, _rx) = crossbeam_channel::unbounded();
        MockDevice {
            id: "detached".to_owned(),
            shared: Arc::clone(&self.shared),
            events: EventSender::new(tx),
        }
    }
}

impl DeviceDriver for MockDriver {
    fn open(&mut self, id: &str, events: EventSender) -> Result<()> {
        self.shared.journal.record("open");
        if self.shared.script.fail_open {
            events.emit(DeviceEvent::OpenFailed("scripted open failure".to_owned()));
        } else {
            let device = MockDevice {
                id: id.to_owned(),
                shared: Arc::clone(&self.shared),
                events: events.clone(),
            };
            events.emit(DeviceEvent::Opened(Box::new(device)));
        }
        Ok(())
    }

    fn monotonic_now_ns(&self) -> Option<i64> {
        Some(0)
    }
}

/// Directory over a fixed device list.
#[derive(Debug, Clone)]
pub struct MockDirectory {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceDirectory for MockDirectory {
    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }
}

/// Device opened by [`MockDriver`].
#[derive(Debug)]
pub struct MockDevice {
    id: String,
    shared: Arc<Shared>,
    events: EventSender,
}

impl Device for MockDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_request(&mut self, template: Template) -> Result<CaptureRequest> {
        self.shared.journal.record("create_request");
        if self.shared.script.fail_create_request {
            return Err(CaptureError::SessionConfigFailed(
                "scripted template failure".to_owned(),
            ));
        }
        Ok(CaptureRequest::new(template))
    }

    fn output_sizes(&self, _format: ImageFormat) -> Vec<Size> {
        self.shared.script.output_sizes.clone()
    }

    fn create_session(&mut self, outputs: &[OutputTarget]) -> Result<()> {
        self.shared.journal.record("create_session");
        *lock(&self.shared.outputs) = outputs.to_vec();
        if self.shared.script.fail_configure {
            self.events.emit(DeviceEvent::ConfigureFailed(
                "scripted configure failure".to_owned(),
            ));
        } else {
            self.events.emit(DeviceEvent::SessionConfigured(Box::new(MockSession {
                shared: Arc::clone(&self.shared),
                events: self.events.clone(),
            })));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.shared.journal.record("device.close");
    }
}

/// Session configured by [`MockDevice`].
#[derive(Debug)]
pub struct MockSession {
    shared: Arc<Shared>,
    events: EventSender,
}

impl MockSession {
    fn emit_capture(&self) {
        let script = &self.shared.script;
        let sequence = self.shared.capture_sequence.fetch_add(1, Ordering::SeqCst);
        let Ok(timestamp_ns) = i64::try_from(sequence).map(|seq| seq * FRAME_INTERVAL_NS) else {
            return;
        };

        let image = Image::new(
            Box::new(TrackedBuffer::new(
                sequence.to_le_bytes().to_vec(),
                Arc::clone(&self.shared.released),
            )),
            Some(timestamp_ns),
        );
        let frame = Frame::new(sequence, Some(timestamp_ns))
            .with_exposure(ExposureState::Converged)
            .with_white_balance(WhiteBalanceState::Converged)
            .with_focus(FocusState::PassiveFocused);

        let repeats = if script.duplicate_completions { 2 } else { 1 };
        if script.images_with_results {
            self.events.emit(DeviceEvent::CaptureResult(frame.with_image(image)));
        } else {
            self.events.emit(DeviceEvent::CaptureResult(frame));
            self.events.emit(DeviceEvent::ImageAvailable(image));
        }
        for _ in 1..repeats {
            self.events.emit(DeviceEvent::CaptureResult(Frame::new(
                sequence,
                Some(timestamp_ns),
            )));
        }
    }
}

impl Session for MockSession {
    fn set_repeating(&mut self, _request: &CaptureRequest) -> Result<()> {
        self.shared.journal.record("set_repeating");
        let script = &self.shared.script;
        for (index, exposure) in script.preview_exposure.iter().enumerate() {
            if script.disconnect_after == Some(index) {
                self.events.emit(DeviceEvent::Disconnected);
                break;
            }
            let sequence = self.shared.preview_sequence.fetch_add(1, Ordering::SeqCst);
            let timestamp_ns = i64::try_from(sequence)
                .ok()
                .map(|seq| seq * FRAME_INTERVAL_NS);
            self.events.emit(DeviceEvent::PreviewResult(
                Frame::new(sequence, timestamp_ns)
                    .with_exposure(*exposure)
                    .with_white_balance(WhiteBalanceState::Converged)
                    .with_focus(FocusState::PassiveFocused),
            ));
        }
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<()> {
        self.shared.journal.record("stop_repeating");
        Ok(())
    }

    fn submit(&mut self, _request: &CaptureRequest) -> Result<()> {
        self.shared.journal.record("submit");
        if self.shared.script.fail_submit {
            return Err(CaptureError::CaptureSubmitFailed("scripted".to_owned()));
        }
        if !self.shared.script.drop_captures {
            self.emit_capture();
        }
        Ok(())
    }

    fn submit_batch(&mut self, requests: &[CaptureRequest]) -> Result<()> {
        self.shared
            .journal
            .record(format!("submit_batch({})", requests.len()));
        let script = &self.shared.script;
        if script.fail_submit {
            return Err(CaptureError::CaptureSubmitFailed("scripted".to_owned()));
        }
        if script.drop_captures {
            return Ok(());
        }

        let base = self.shared.capture_sequence.load(Ordering::SeqCst);
        let order = script
            .completion_order
            .clone()
            .unwrap_or_else(|| (1..=requests.len()).collect());
        for position in order {
            let Ok(offset) = u64::try_from(position.saturating_sub(1)) else {
                continue;
            };
            self.shared
                .capture_sequence
                .store(base + offset, Ordering::SeqCst);
            self.emit_capture();
        }
        let count = u64::try_from(requests.len()).unwrap_or(0);
        self.shared
            .capture_sequence
            .store(base + count, Ordering::SeqCst);
        Ok(())
    }

    fn supports_abort(&self) -> bool {
        self.shared.script.supports_abort
    }

    fn abort(&mut self) -> Result<()> {
        self.shared.journal.record("abort");
        Ok(())
    }

    fn close(&mut self) {
        self.shared.journal.record("session.close");
    }
}

/// Buffer that counts its own release.
#[derive(Debug)]
pub struct TrackedBuffer {
    data: Vec<u8>,
    released: Arc<AtomicUsize>,
}

impl TrackedBuffer {
    /// Wrap `data`, bumping `released` when dropped.
    pub const fn new(data: Vec<u8>, released: Arc<AtomicUsize>) -> Self {
        Self { data, released }
    }
}

impl ImageBuffer for TrackedBuffer {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory storage. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    saved: Arc<Mutex<Vec<(i64, String, Vec<u8>)>>>,
    failing: bool,
}

impl MemoryStorage {
    /// Storage whose every write fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// `(captured_at_ms, extension, bytes)` for every write, in order.
    pub fn saved(&self) -> Vec<(i64, String, Vec<u8>)> {
        lock(&self.saved).clone()
    }
}

impl Storage for MemoryStorage {
    fn persist(&self, bytes: &[u8], captured_at_ms: i64, extension: &str) -> Result<PathBuf> {
        if self.failing {
            return Err(CaptureError::PersistenceFailed("storage offline".to_owned()));
        }
        lock(&self.saved).push((captured_at_ms, extension.to_owned(), bytes.to_vec()));
        Ok(PathBuf::from(format!("memory/burst_{captured_at_ms}.{extension}")))
    }
}

/// Host that records every outcome it is told about.
#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    outcomes: Arc<Mutex<Vec<SessionOutcome>>>,
}

impl RecordingHost {
    /// Outcomes received so far.
    pub fn outcomes(&self) -> Vec<SessionOutcome> {
        lock(&self.outcomes).clone()
    }
}

impl LifecycleHost for RecordingHost {
    fn notify_finished(&mut self, outcome: &SessionOutcome) {
        lock(&self.outcomes).push(outcome.clone());
    }
}

/// Fixed authorization answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuthorization(pub bool);

impl Authorization for StaticAuthorization {
    fn has_capture_authorization(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(rx: &crossbeam_channel::Receiver<crate::traits::WorkerEvent>) -> Vec<String> {
        rx.try_iter().map(|event| format!("{event:?}")).collect()
    }

    #[test]
    fn test_batch_completes_in_scripted_order() {
        let driver = MockDriver::new(Script {
            completion_order: Some(vec![3, 1, 2]),
            images_with_results: true,
            ..Script::default()
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = MockSession {
            shared: Arc::clone(&driver.shared),
            events: EventSender::new(tx),
        };

        let batch = vec![CaptureRequest::new(Template::StillCapture); 3];
        session.submit_batch(&batch).expect("batch should submit");

        assert_eq!(
            collect(&rx),
            vec![
                "Device(CaptureResult(#1002))",
                "Device(CaptureResult(#1000))",
                "Device(CaptureResult(#1001))",
            ]
        );
        assert_eq!(driver.journal().entries(), vec!["submit_batch(3)"]);
    }

    #[test]
    fn test_repeating_stops_at_disconnect() {
        let driver = MockDriver::new(Script {
            disconnect_after: Some(1),
            ..Script::default()
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = MockSession {
            shared: Arc::clone(&driver.shared),
            events: EventSender::new(tx),
        };

        session
            .set_repeating(&CaptureRequest::new(Template::Preview))
            .expect("repeating should start");

        assert_eq!(
            collect(&rx),
            vec!["Device(PreviewResult(#1))", "Device(Disconnected)"]
        );
    }

    #[test]
    fn test_buffer_release_is_counted() {
        let driver = MockDriver::new(Script::default());
        let image = Image::new(
            Box::new(TrackedBuffer::new(vec![1, 2], Arc::clone(&driver.shared.released))),
            None,
        );
        assert_eq!(image.data(), &[1, 2]);
        drop(image);
        assert_eq!(driver.released(), 1);
    }
}
