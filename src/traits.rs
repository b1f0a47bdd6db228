//! Core data model and collaborator contracts for the capture orchestrator.
//!
//! Everything the orchestrator consumes from the outside world (device
//! driver, device directory, storage, lifecycle host) is a trait here, so
//! the same state machine runs against V4L2 hardware or a scripted mock.

use std::fmt;
use std::path::PathBuf;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};

/// Auto-exposure state reported with a metadata frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExposureState {
    /// The device does not report exposure state.
    #[default]
    Unsupported,
    /// Auto-exposure is off or not yet started.
    Inactive,
    /// Auto-exposure is still adjusting.
    Searching,
    /// Auto-exposure has a good set of values.
    Converged,
    /// Auto-exposure values are locked.
    Locked,
    /// Converged, but the scene needs flash.
    FlashRequired,
    /// A precapture sequence is running.
    Precapture,
}

impl ExposureState {
    /// Whether this state does not block a capture.
    pub const fn is_acceptable(self) -> bool {
        matches!(self, Self::Converged | Self::Locked | Self::Unsupported)
    }
}

impl fmt::Display for ExposureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsupported => "UNKNOWN",
            Self::Inactive => "INACTIVE",
            Self::Searching => "SEARCHING",
            Self::Converged => "CONVERGED",
            Self::Locked => "LOCKED",
            Self::FlashRequired => "FLASH_REQUIRED",
            Self::Precapture => "PRECAPTURE",
        };
        f.write_str(name)
    }
}

/// Auto-white-balance state reported with a metadata frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhiteBalanceState {
    /// The device does not report white-balance state.
    #[default]
    Unsupported,
    /// White balance is off or not yet started.
    Inactive,
    /// White balance is still adjusting.
    Searching,
    /// White balance has a good set of values.
    Converged,
    /// White balance values are locked.
    Locked,
}

impl WhiteBalanceState {
    /// Whether this state does not block a capture.
    pub const fn is_acceptable(self) -> bool {
        matches!(self, Self::Converged | Self::Locked | Self::Unsupported)
    }
}

impl fmt::Display for WhiteBalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsupported => "UNKNOWN",
            Self::Inactive => "INACTIVE",
            Self::Searching => "SEARCHING",
            Self::Converged => "CONVERGED",
            Self::Locked => "LOCKED",
        };
        f.write_str(name)
    }
}

/// Autofocus state reported with a metadata frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusState {
    /// The device does not report focus state.
    #[default]
    Unsupported,
    /// Autofocus is off or not yet started.
    Inactive,
    /// Continuous autofocus is scanning.
    PassiveScan,
    /// Continuous autofocus believes the scene is in focus.
    PassiveFocused,
    /// A triggered autofocus scan is running.
    ActiveScan,
    /// Focus is locked and sharp.
    FocusedLocked,
    /// Focus is locked but not sharp.
    NotFocusedLocked,
    /// Continuous autofocus believes the scene is out of focus.
    PassiveUnfocused,
}

impl FocusState {
    /// Whether this state does not block a capture.
    pub const fn is_acceptable(self) -> bool {
        matches!(
            self,
            Self::FocusedLocked | Self::PassiveFocused | Self::Unsupported
        )
    }
}

impl fmt::Display for FocusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsupported => "UNKNOWN",
            Self::Inactive => "INACTIVE",
            Self::PassiveScan => "PASSIVE_SCAN",
            Self::PassiveFocused => "PASSIVE_FOCUSED",
            Self::ActiveScan => "ACTIVE_SCAN",
            Self::FocusedLocked => "FOCUSED_LOCKED",
            Self::NotFocusedLocked => "NOT_FOCUSED_LOCKED",
            Self::PassiveUnfocused => "PASSIVE_UNFOCUSED",
        };
        f.write_str(name)
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count, used to pick the largest output size.
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Encoded still-image format, selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Baseline JPEG.
    #[default]
    Jpeg,
    /// HEIF/HEIC container.
    Heic,
}

impl ImageFormat {
    /// File extension for persisted images of this format.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Heic => "heic",
        }
    }
}

/// Pixel payload backing an [`Image`].
///
/// Dropping the buffer hands it back to the producing device. Drivers
/// whose buffers are a scarce pool implement `Drop` to requeue them.
pub trait ImageBuffer: Send {
    /// Encoded image bytes.
    fn data(&self) -> &[u8];
}

impl ImageBuffer for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }
}

/// An image payload produced by the image output target.
///
/// Holding an `Image` holds a device buffer; it is released when dropped.
pub struct Image {
    buffer: Box<dyn ImageBuffer>,
    timestamp_ns: Option<i64>,
}

impl Image {
    /// Wrap a device buffer captured at the given device-clock timestamp.
    pub fn new(buffer: Box<dyn ImageBuffer>, timestamp_ns: Option<i64>) -> Self {
        Self {
            buffer,
            timestamp_ns,
        }
    }

    /// Wrap owned bytes that need no release beyond deallocation.
    pub fn from_bytes(bytes: Vec<u8>, timestamp_ns: Option<i64>) -> Self {
        Self::new(Box::new(bytes), timestamp_ns)
    }

    /// Encoded image bytes.
    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    /// Device-clock capture timestamp in nanoseconds.
    pub const fn timestamp_ns(&self) -> Option<i64> {
        self.timestamp_ns
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("len", &self.data().len())
            .field("timestamp_ns", &self.timestamp_ns)
            .finish()
    }
}

/// Metadata record produced by the device for every preview or capture request.
#[derive(Debug, Default)]
pub struct Frame {
    /// Per-session frame number, strictly increasing.
    pub sequence: u64,
    /// Device monotonic clock reading in nanoseconds.
    pub timestamp_ns: Option<i64>,
    /// Auto-exposure state.
    pub exposure: ExposureState,
    /// Auto-white-balance state.
    pub white_balance: WhiteBalanceState,
    /// Autofocus state.
    pub focus: FocusState,
    /// Pixel data, when this request also produced an image.
    pub image: Option<Image>,
}

impl Frame {
    /// Create a metadata-only frame with every 3A state unsupported.
    pub fn new(sequence: u64, timestamp_ns: Option<i64>) -> Self {
        Self {
            sequence,
            timestamp_ns,
            ..Self::default()
        }
    }

    /// Set the exposure state.
    #[must_use]
    pub fn with_exposure(mut self, exposure: ExposureState) -> Self {
        self.exposure = exposure;
        self
    }

    /// Set the white-balance state.
    #[must_use]
    pub fn with_white_balance(mut self, white_balance: WhiteBalanceState) -> Self {
        self.white_balance = white_balance;
        self
    }

    /// Set the focus state.
    #[must_use]
    pub fn with_focus(mut self, focus: FocusState) -> Self {
        self.focus = focus;
        self
    }

    /// Attach an image payload.
    #[must_use]
    pub fn with_image(mut self, image: Image) -> Self {
        self.image = Some(image);
        self
    }
}

/// Which way a device's lens points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Rear/back-facing lens.
    #[default]
    Back,
    /// Front/user-facing lens.
    Front,
    /// Externally attached camera.
    External,
}

/// Entry returned by the device directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Driver-specific device identifier.
    pub id: String,
    /// Lens facing.
    pub facing: Facing,
}

/// Request template a descriptor is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// Low-latency streaming preview.
    Preview,
    /// High-quality still capture.
    StillCapture,
}

/// Session output a request writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Discard-only preview target.
    Preview,
    /// Image-producing target.
    Image,
}

/// Autofocus mode carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfMode {
    /// Driver default.
    #[default]
    Auto,
    /// Continuous focus tuned for stills.
    ContinuousPicture,
}

/// Noise-reduction mode carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoiseReduction {
    /// No noise reduction.
    Off,
    /// Driver default.
    #[default]
    Fast,
    /// Slowest, best quality.
    HighQuality,
}

/// Mutable request descriptor submitted to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Template this descriptor was created from.
    pub template: Template,
    /// Outputs written by this request.
    pub targets: Vec<OutputKind>,
    /// Autofocus mode.
    pub af_mode: AfMode,
    /// Noise-reduction mode.
    pub noise_reduction: NoiseReduction,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Produce the still from buffered preview data (zero shutter lag).
    pub enable_zsl: bool,
}

impl CaptureRequest {
    /// Create a descriptor with driver defaults for `template`.
    pub const fn new(template: Template) -> Self {
        Self {
            template,
            targets: Vec::new(),
            af_mode: AfMode::Auto,
            noise_reduction: NoiseReduction::Fast,
            jpeg_quality: 95,
            enable_zsl: false,
        }
    }

    /// Add an output target, ignoring duplicates.
    pub fn add_target(&mut self, target: OutputKind) {
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
    }
}

/// Output target a session is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    /// Preview or image output.
    pub kind: OutputKind,
    /// Buffer dimensions.
    pub size: Size,
    /// Encoded format, image outputs only.
    pub format: Option<ImageFormat>,
    /// Maximum buffers the target can hold at once.
    pub max_images: u32,
}

/// Callback delivered by a driver to the orchestrator's worker.
pub enum DeviceEvent {
    /// `DeviceDriver::open` succeeded.
    Opened(Box<dyn Device>),
    /// `DeviceDriver::open` failed asynchronously.
    OpenFailed(String),
    /// `Device::create_session` succeeded.
    SessionConfigured(Box<dyn Session>),
    /// `Device::create_session` failed asynchronously.
    ConfigureFailed(String),
    /// Metadata for a repeating preview request.
    PreviewResult(Frame),
    /// Metadata for a submitted still capture.
    CaptureResult(Frame),
    /// The image output produced a payload.
    ImageAvailable(Image),
    /// The device went away.
    Disconnected,
    /// The device reported a fatal error code.
    Error(i32),
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened(device) => write!(f, "Opened({})", device.id()),
            Self::OpenFailed(reason) => write!(f, "OpenFailed({reason})"),
            Self::SessionConfigured(_) => f.write_str("SessionConfigured"),
            Self::ConfigureFailed(reason) => write!(f, "ConfigureFailed({reason})"),
            Self::PreviewResult(frame) => write!(f, "PreviewResult(#{})", frame.sequence),
            Self::CaptureResult(frame) => write!(f, "CaptureResult(#{})", frame.sequence),
            Self::ImageAvailable(image) => write!(f, "ImageAvailable({image:?})"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Error(code) => write!(f, "Error({code})"),
        }
    }
}

/// Message consumed by the session worker.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Device(DeviceEvent),
    TeardownRequested,
}

/// Handle drivers use to deliver callbacks to the session worker.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<WorkerEvent>,
}

impl EventSender {
    pub(crate) const fn new(tx: Sender<WorkerEvent>) -> Self {
        Self { tx }
    }

    /// Deliver a callback. Returns `false` once the worker has exited.
    pub fn emit(&self, event: DeviceEvent) -> bool {
        self.tx.send(WorkerEvent::Device(event)).is_ok()
    }
}

/// Final result of one session, reported to the lifecycle host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The burst completed and the session closed normally.
    Completed {
        /// Capture completions observed.
        captured: u32,
        /// Images written by the storage collaborator.
        persisted: u32,
        /// Images discarded by the sink or lost to persistence failures.
        dropped: u64,
    },
    /// The session ended on a fatal error.
    Failed(CaptureError),
}

impl SessionOutcome {
    /// Whether the session completed normally.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Gate consulted once before a session starts.
pub trait Authorization {
    /// Whether this process may use the capture device.
    fn has_capture_authorization(&self) -> bool;
}

/// Lists the capture devices present on the system.
pub trait DeviceDirectory: Send {
    /// All devices, in driver order.
    fn list_devices(&self) -> Vec<DeviceDescriptor>;
}

/// Opens devices. Results arrive as [`DeviceEvent`]s on `events`.
pub trait DeviceDriver: Send {
    /// Start opening `id`; delivers `Opened` or `OpenFailed`.
    fn open(&mut self, id: &str, events: EventSender) -> Result<()>;

    /// Current reading of the clock frame timestamps are expressed in.
    fn monotonic_now_ns(&self) -> Option<i64>;
}

/// An opened capture device.
pub trait Device: Send {
    /// Identifier the device was opened with.
    fn id(&self) -> &str;

    /// Build a fresh request descriptor from `template`.
    fn create_request(&mut self, template: Template) -> Result<CaptureRequest>;

    /// Output sizes supported for `format`, in any order.
    fn output_sizes(&self, format: ImageFormat) -> Vec<Size>;

    /// Start configuring a session; delivers `SessionConfigured` or `ConfigureFailed`.
    fn create_session(&mut self, outputs: &[OutputTarget]) -> Result<()>;

    /// Close the device. Must tolerate repeated calls.
    fn close(&mut self);
}

/// A configured capture session.
pub trait Session: Send {
    /// Start streaming `request` repeatedly; results arrive as `PreviewResult`.
    fn set_repeating(&mut self, request: &CaptureRequest) -> Result<()>;

    /// Stop the repeating request. In-flight frames may still be delivered.
    fn stop_repeating(&mut self) -> Result<()>;

    /// Submit one capture; its result arrives as `CaptureResult`.
    fn submit(&mut self, request: &CaptureRequest) -> Result<()>;

    /// Submit captures as a single atomic batch.
    fn submit_batch(&mut self, requests: &[CaptureRequest]) -> Result<()>;

    /// Whether [`Session::abort`] discards in-flight work.
    fn supports_abort(&self) -> bool {
        false
    }

    /// Discard in-flight work as fast as possible. No-op by default.
    fn abort(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the session. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Writes image bytes to durable storage.
pub trait Storage: Send {
    /// Persist one image captured at `captured_at_ms` (UTC milliseconds).
    fn persist(&self, bytes: &[u8], captured_at_ms: i64, extension: &str) -> Result<PathBuf>;
}

/// The component hosting the orchestrator.
pub trait LifecycleHost: Send {
    /// Called exactly once per session with its final outcome.
    fn notify_finished(&mut self, outcome: &SessionOutcome);
}
