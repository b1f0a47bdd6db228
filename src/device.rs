//! V4L2 driver implementation using the v4l crate.
//!
//! V4L2 exposes one capture queue per node, so the preview and image
//! targets share a single MJPG stream at the still size. A dedicated
//! capture thread dequeues buffers and routes each one either to a pending
//! still capture or to the repeating preview. V4L2 reports no 3A state, so
//! every frame carries `Unsupported` and passes any convergence policy.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use nix::time::{clock_gettime, ClockId};
use tracing::{debug, error, info, warn};
use v4l::buffer::{Metadata, Type};
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::FourCC;

use crate::error::{CaptureError, Result};
use crate::traits::{
    Authorization, CaptureRequest, Device, DeviceDescriptor, DeviceDirectory, DeviceDriver,
    DeviceEvent, EventSender, Facing, Frame, Image, ImageFormat, OutputKind, OutputTarget,
    Session, Size, Template,
};

/// `ENODEV`: the node vanished under an open stream.
const ENODEV: i32 = 19;

/// Capture results are numbered apart from preview frames.
const CAPTURE_SEQUENCE_BASE: u64 = 1 << 32;

/// How long the capture thread blocks on a dequeue before rechecking control messages.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

const MJPG: [u8; 4] = *b"MJPG";

/// Current `CLOCK_MONOTONIC` reading, the clock V4L2 stamps buffers with.
fn monotonic_ns() -> Option<i64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?;
    i64::try_from(Duration::from(now).as_nanos()).ok()
}

/// Kernel buffer timestamp in nanoseconds. `None` when the driver left it unset.
fn kernel_time_ns(sec: i64, usec: i64) -> Option<i64> {
    if sec <= 0 && usec <= 0 {
        return None;
    }
    sec.checked_mul(1_000_000_000)?
        .checked_add(usec.checked_mul(1_000)?)
}

/// Production driver over `/dev/video*` nodes.
#[derive(Debug, Clone)]
pub struct V4l2Driver {
    facing: Facing,
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new(Facing::Back)
    }
}

impl V4l2Driver {
    /// Create a driver reporting every node as `facing`.
    ///
    /// V4L2 has no notion of lens facing; the caller decides.
    pub const fn new(facing: Facing) -> Self {
        Self { facing }
    }
}

fn can_stream(device: &v4l::Device) -> bool {
    device.query_caps().is_ok_and(|caps| {
        caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            && caps.capabilities.contains(Flags::STREAMING)
    })
}

impl DeviceDirectory for V4l2Driver {
    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);

        nodes
            .into_iter()
            .filter(|node| {
                v4l::Device::with_path(node.path()).is_ok_and(|device| can_stream(&device))
            })
            .map(|node| {
                debug!(path = %node.path().display(), name = ?node.name(), "found capture node");
                DeviceDescriptor {
                    id: node.path().display().to_string(),
                    facing: self.facing,
                }
            })
            .collect()
    }
}

impl DeviceDriver for V4l2Driver {
    fn open(&mut self, id: &str, events: EventSender) -> Result<()> {
        let device = match v4l::Device::with_path(id) {
            Ok(device) => device,
            Err(err) => {
                events.emit(DeviceEvent::OpenFailed(format!("{id}: {err}")));
                return Ok(());
            }
        };

        match device.query_caps() {
            Ok(caps) if caps.capabilities.contains(Flags::VIDEO_CAPTURE) => {
                info!(
                    card = %caps.card,
                    driver = %caps.driver,
                    bus = %caps.bus,
                    "opened V4L2 device"
                );
                events.emit(DeviceEvent::Opened(Box::new(V4l2Device {
                    id: id.to_owned(),
                    device: Some(device),
                    capture: None,
                    events: events.clone(),
                })));
            }
            Ok(_) => {
                events.emit(DeviceEvent::OpenFailed(format!("{id}: not a capture device")));
            }
            Err(err) => {
                events.emit(DeviceEvent::OpenFailed(format!("{id}: {err}")));
            }
        }
        Ok(())
    }

    fn monotonic_now_ns(&self) -> Option<i64> {
        monotonic_ns()
    }
}

/// The capture thread owning a node's stream.
struct CaptureHandle {
    control: Sender<StreamControl>,
    thread: JoinHandle<()>,
}

/// An opened V4L2 node. The handle moves into the capture thread once a
/// session is configured; closing the device stops and joins that thread.
pub struct V4l2Device {
    id: String,
    device: Option<v4l::Device>,
    capture: Option<CaptureHandle>,
    events: EventSender,
}

impl V4l2Device {
    fn configure(&mut self, outputs: &[OutputTarget]) -> std::result::Result<(), String> {
        let image = outputs
            .iter()
            .find(|target| target.kind == OutputKind::Image)
            .ok_or_else(|| "no image output".to_owned())?;
        if image.format != Some(ImageFormat::Jpeg) {
            return Err(format!("{:?} output is not supported by V4L2", image.format));
        }
        let device = self
            .device
            .take()
            .ok_or_else(|| "device already streaming or closed".to_owned())?;

        let mut format = device.format().map_err(|err| err.to_string())?;
        format.width = image.size.width;
        format.height = image.size.height;
        format.fourcc = FourCC::new(&MJPG);
        let format = device.set_format(&format).map_err(|err| err.to_string())?;
        if format.fourcc != FourCC::new(&MJPG) {
            return Err(format!("device refused MJPG, offered {}", format.fourcc));
        }
        info!(
            width = format.width,
            height = format.height,
            "configured MJPG stream"
        );

        let buffers = outputs
            .iter()
            .map(|target| target.max_images)
            .max()
            .unwrap_or(1)
            .max(2);

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let session = V4l2Session {
            control: control_tx.clone(),
        };
        let mut worker = CaptureThread::new(control_rx, self.events.clone(), buffers);
        let thread = std::thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || worker.run(&device, session))
            .map_err(|err| format!("capture thread: {err}"))?;

        self.capture = Some(CaptureHandle {
            control: control_tx,
            thread,
        });
        Ok(())
    }
}

impl Device for V4l2Device {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_request(&mut self, template: Template) -> Result<CaptureRequest> {
        if self.device.is_none() && self.capture.is_none() {
            return Err(CaptureError::DeviceDisconnected);
        }
        Ok(CaptureRequest::new(template))
    }

    fn output_sizes(&self, format: ImageFormat) -> Vec<Size> {
        let Some(device) = self.device.as_ref() else {
            return Vec::new();
        };
        if format != ImageFormat::Jpeg {
            return Vec::new();
        }

        device
            .enum_framesizes(FourCC::new(&MJPG))
            .map(|sizes| {
                sizes
                    .into_iter()
                    .map(|framesize| match framesize.size {
                        FrameSizeEnum::Discrete(size) => Size::new(size.width, size.height),
                        FrameSizeEnum::Stepwise(step) => Size::new(step.max_width, step.max_height),
                    })
                    .collect()
            })
            .unwrap_or_else(|err| {
                warn!(error = %err, "cannot enumerate MJPG frame sizes");
                Vec::new()
            })
    }

    /// Stream setup finishes on the capture thread, which then delivers
    /// `SessionConfigured` or `ConfigureFailed`.
    fn create_session(&mut self, outputs: &[OutputTarget]) -> Result<()> {
        if let Err(reason) = self.configure(outputs) {
            self.events.emit(DeviceEvent::ConfigureFailed(reason));
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(capture) = self.capture.take() {
            let _ = capture.control.send(StreamControl::Close);
            if capture.thread.join().is_err() {
                error!("capture thread panicked");
            }
            debug!(device = %self.id, "capture thread joined");
        }
        if self.device.take().is_some() {
            debug!(device = %self.id, "V4L2 device released");
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
enum StreamControl {
    Repeat(bool),
    Capture(u32),
    Abort,
    Close,
}

/// Streaming session: a control channel into the capture thread.
pub struct V4l2Session {
    control: Sender<StreamControl>,
}

impl V4l2Session {
    fn send(&self, message: StreamControl) -> Result<()> {
        self.control
            .send(message)
            .map_err(|_| CaptureError::DeviceDisconnected)
    }
}

impl Session for V4l2Session {
    fn set_repeating(&mut self, _request: &CaptureRequest) -> Result<()> {
        self.send(StreamControl::Repeat(true))
    }

    fn stop_repeating(&mut self) -> Result<()> {
        self.send(StreamControl::Repeat(false))
    }

    fn submit(&mut self, _request: &CaptureRequest) -> Result<()> {
        self.send(StreamControl::Capture(1))
    }

    fn submit_batch(&mut self, requests: &[CaptureRequest]) -> Result<()> {
        let count = u32::try_from(requests.len())
            .map_err(|_| CaptureError::CaptureSubmitFailed("batch too large".to_owned()))?;
        self.send(StreamControl::Capture(count))
    }

    fn supports_abort(&self) -> bool {
        true
    }

    fn abort(&mut self) -> Result<()> {
        self.send(StreamControl::Abort)
    }

    fn close(&mut self) {
        if self.control.send(StreamControl::Close).is_ok() {
            debug!("capture stream stopping");
        }
    }
}

/// One dequeued buffer.
struct Dequeued {
    data: Vec<u8>,
    sequence: u32,
    timestamp_ns: Option<i64>,
}

impl Dequeued {
    fn new(buf: &[u8], meta: &Metadata) -> Self {
        let len = usize::try_from(meta.bytesused).unwrap_or(buf.len());
        #[allow(clippy::useless_conversion)]
        let timestamp_ns =
            kernel_time_ns(i64::from(meta.timestamp.sec), i64::from(meta.timestamp.usec));
        Self {
            data: buf.get(..len).unwrap_or(buf).to_vec(),
            sequence: meta.sequence,
            timestamp_ns,
        }
    }
}

struct CaptureThread {
    control: Receiver<StreamControl>,
    events: EventSender,
    buffers: u32,
    repeating: bool,
    pending: u32,
    in_flight: u32,
}

impl CaptureThread {
    const fn new(control: Receiver<StreamControl>, events: EventSender, buffers: u32) -> Self {
        Self {
            control,
            events,
            buffers,
            repeating: false,
            pending: 0,
            in_flight: 0,
        }
    }

    fn run(&mut self, device: &v4l::Device, session: V4l2Session) {
        let mut stream = match Stream::with_buffers(device, Type::VideoCapture, self.buffers) {
            Ok(stream) => stream,
            Err(err) => {
                self.announce(Err(format!("stream setup: {err}")));
                return;
            }
        };
        stream.set_timeout(DEQUEUE_TIMEOUT);
        if !self.announce(Ok(session)) {
            return;
        }

        loop {
            if !self.apply_control() {
                break;
            }
            if !self.is_busy() {
                continue;
            }

            let dequeued = match stream.next() {
                Ok((buf, meta)) => Dequeued::new(buf, meta),
                Err(err)
                    if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
                {
                    continue
                }
                Err(err) => {
                    self.report_stream_error(&err);
                    break;
                }
            };

            if !self.deliver(dequeued) {
                debug!("session worker gone, stopping capture thread");
                break;
            }
        }
        debug!("capture thread exiting");
    }

    /// Report the outcome of stream setup. Returns `false` when streaming should not start.
    fn announce(&self, setup: std::result::Result<V4l2Session, String>) -> bool {
        match setup {
            Ok(session) => {
                debug!(buffers = self.buffers, "capture stream ready");
                self.events
                    .emit(DeviceEvent::SessionConfigured(Box::new(session)))
            }
            Err(reason) => {
                error!(%reason, "capture stream setup failed");
                self.events.emit(DeviceEvent::ConfigureFailed(reason));
                false
            }
        }
    }

    const fn is_busy(&self) -> bool {
        self.repeating || self.pending > 0 || self.in_flight > 0
    }

    /// Apply queued control messages. Blocks while idle. Returns `false` on close.
    fn apply_control(&mut self) -> bool {
        loop {
            let message = if self.is_busy() {
                match self.control.try_recv() {
                    Ok(message) => message,
                    Err(TryRecvError::Empty) => return true,
                    Err(TryRecvError::Disconnected) => return false,
                }
            } else {
                match self.control.recv() {
                    Ok(message) => message,
                    Err(_) => return false,
                }
            };

            match message {
                StreamControl::Repeat(true) => self.repeating = true,
                StreamControl::Repeat(false) => {
                    if self.repeating {
                        self.in_flight = self.buffers;
                    }
                    self.repeating = false;
                }
                StreamControl::Capture(count) => self.pending = self.pending.saturating_add(count),
                StreamControl::Abort => {
                    debug!(pending = self.pending, "discarding pending captures");
                    self.pending = 0;
                    self.in_flight = 0;
                }
                StreamControl::Close => return false,
            }
        }
    }

    /// Route a buffer to a pending still or to the preview. Frames keep the
    /// kernel's sequence number and capture time.
    fn deliver(&mut self, dequeued: Dequeued) -> bool {
        let Dequeued {
            data,
            sequence,
            timestamp_ns,
        } = dequeued;
        let timestamp_ns = timestamp_ns.or_else(monotonic_ns);

        if self.pending > 0 {
            self.pending -= 1;
            let sequence = CAPTURE_SEQUENCE_BASE + u64::from(sequence);
            debug!(frame = sequence, bytes = data.len(), "still captured");
            let frame =
                Frame::new(sequence, timestamp_ns).with_image(Image::from_bytes(data, timestamp_ns));
            return self.events.emit(DeviceEvent::CaptureResult(frame));
        }

        if !self.repeating {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        self.events.emit(DeviceEvent::PreviewResult(Frame::new(
            u64::from(sequence),
            timestamp_ns,
        )))
    }

    fn report_stream_error(&self, err: &io::Error) {
        error!(error = %err, "V4L2 dequeue failed");
        let event = match err.raw_os_error() {
            Some(ENODEV) => DeviceEvent::Disconnected,
            Some(code) => DeviceEvent::Error(code),
            None => DeviceEvent::Error(-1),
        };
        self.events.emit(event);
    }
}

/// Authorization granted when some `/dev/video*` node can be opened for read and write.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeAccess;

impl NodeAccess {
    fn nodes() -> Vec<PathBuf> {
        v4l::context::enum_devices()
            .into_iter()
            .map(|node| node.path().to_path_buf())
            .collect()
    }
}

impl Authorization for NodeAccess {
    fn has_capture_authorization(&self) -> bool {
        Self::nodes().iter().any(|path| {
            let access = OpenOptions::new().read(true).write(true).open(path);
            if let Err(err) = &access {
                debug!(path = %path.display(), error = %err, "node not accessible");
            }
            access.is_ok()
        })
    }
}
