//! Session lifecycle: startup, the worker event loop, and ordered teardown.
//!
//! One dedicated worker thread owns the device, the session, the request
//! templates and the [`BurstController`]. Driver callbacks and the host's
//! teardown signal arrive on a single channel, so no two transitions ever
//! run concurrently. Commands the controller emits are executed in a
//! queue on the same thread; follow-up events they produce are fed back in
//! order instead of recursing into the transition in progress.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::config::BurstConfig;
use crate::controller::{BurstController, BurstState, Command, ControllerEvent};
use crate::error::{CaptureError, Result};
use crate::sink::ImageSink;
use crate::templates::RequestTemplateCache;
use crate::timestamp::{format_utc, TimestampTranslator};
use crate::traits::{
    Authorization, Device, DeviceDirectory, DeviceDriver, DeviceEvent, EventSender, Facing, Frame,
    Image, LifecycleHost, OutputKind, OutputTarget, Session, SessionOutcome, Storage, WorkerEvent,
};

/// External collaborators a session is wired to.
pub struct Collaborators {
    /// Consulted once before startup.
    pub authorization: Box<dyn Authorization>,
    /// Lists candidate devices.
    pub directory: Box<dyn DeviceDirectory>,
    /// Opens the selected device.
    pub driver: Box<dyn DeviceDriver>,
    /// Persists drained images.
    pub storage: Box<dyn Storage>,
    /// Receives the final outcome.
    pub host: Box<dyn LifecycleHost>,
}

/// A lifecycle host that only logs the outcome.
#[derive(Debug, Default)]
pub struct LoggingHost;

impl LifecycleHost for LoggingHost {
    fn notify_finished(&mut self, outcome: &SessionOutcome) {
        match outcome {
            SessionOutcome::Completed {
                captured,
                persisted,
                dropped,
            } => info!(captured, persisted, dropped, "burst session finished"),
            SessionOutcome::Failed(reason) => error!(error = %reason, "burst session failed"),
        }
    }
}

/// Delivers the outcome to the host at most once, from whichever thread ends the session.
#[derive(Clone)]
struct FinishNotifier {
    host: Arc<Mutex<Option<Box<dyn LifecycleHost>>>>,
}

impl fmt::Debug for FinishNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinishNotifier").finish_non_exhaustive()
    }
}

impl FinishNotifier {
    fn new(host: Box<dyn LifecycleHost>) -> Self {
        Self {
            host: Arc::new(Mutex::new(Some(host))),
        }
    }

    fn notify(&self, outcome: &SessionOutcome) {
        let host = match self.host.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut host) = host {
            host.notify_finished(outcome);
        }
    }
}

/// A configured, not yet started capture session.
pub struct Orchestrator {
    config: BurstConfig,
    collaborators: Collaborators,
}

impl Orchestrator {
    /// Wire a session to its collaborators.
    pub const fn new(config: BurstConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    /// Start the session on a dedicated worker thread.
    ///
    /// Fails without starting when authorization is denied; the host is
    /// still notified exactly once.
    pub fn on_foreground(self) -> Result<OrchestratorHandle> {
        let Collaborators {
            authorization,
            directory,
            driver,
            storage,
            host,
        } = self.collaborators;
        let notifier = FinishNotifier::new(host);

        if !authorization.has_capture_authorization() {
            error!("missing capture authorization");
            let reason = CaptureError::AuthorizationDenied;
            notifier.notify(&SessionOutcome::Failed(reason.clone()));
            return Err(reason);
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = SessionWorker::new(
            self.config,
            directory,
            driver,
            storage,
            notifier.clone(),
            rx,
            EventSender::new(tx.clone()),
        );

        let join = std::thread::Builder::new()
            .name("burst-capture-worker".to_owned())
            .spawn(move || worker.run())
            .map_err(|err| {
                let reason = CaptureError::DeviceOpenFailed(format!("worker thread: {err}"));
                notifier.notify(&SessionOutcome::Failed(reason.clone()));
                reason
            })?;

        Ok(OrchestratorHandle {
            tx,
            join,
            notifier,
        })
    }
}

/// Lifecycle-side handle to a running session.
///
/// The handle never touches controller state; it can only post the
/// teardown signal and wait for the worker to exit.
#[derive(Debug)]
pub struct OrchestratorHandle {
    tx: Sender<WorkerEvent>,
    join: JoinHandle<SessionOutcome>,
    notifier: FinishNotifier,
}

impl OrchestratorHandle {
    /// Ask the worker to end the session now. No-op once it has finished.
    pub fn on_teardown_requested(&self) {
        if self.tx.send(WorkerEvent::TeardownRequested).is_err() {
            debug!("teardown requested after worker exit");
        }
    }

    /// Block until the worker exits and return the session outcome.
    ///
    /// A panicked worker never reached its own notification, so the host
    /// hears about it from here.
    pub fn wait(self) -> SessionOutcome {
        self.join.join().unwrap_or_else(|_| {
            error!("session worker panicked");
            let outcome = SessionOutcome::Failed(CaptureError::WorkerPanicked);
            self.notifier.notify(&outcome);
            outcome
        })
    }
}

/// Everything the worker must release, in release order.
#[derive(Default)]
struct SessionResources {
    session: Option<Box<dyn Session>>,
    repeating: bool,
    device: Option<Box<dyn Device>>,
    templates: Option<RequestTemplateCache>,
    image_target: Option<OutputTarget>,
    preview_target: Option<OutputTarget>,
}

impl SessionResources {
    /// Ordered, idempotent release. Each step tolerates its resource being gone.
    fn release(&mut self, sink: &mut ImageSink) -> u64 {
        if let Some(session) = self.session.as_mut() {
            if self.repeating {
                if let Err(err) = session.stop_repeating() {
                    warn!(error = %err, "stop repeating during teardown failed");
                }
            }
        }
        self.repeating = false;

        if let Some(mut session) = self.session.take() {
            session.close();
            debug!("session closed");
        }
        if let Some(mut device) = self.device.take() {
            device.close();
            debug!("device closed");
        }
        self.templates = None;

        let leftover = sink.drain_all().count() as u64;
        if leftover > 0 {
            warn!(leftover, "releasing undrained images");
        }
        if let Some(target) = self.image_target.take() {
            debug!(?target, "image target released");
        }
        if let Some(target) = self.preview_target.take() {
            debug!(?target, "preview target released");
        }
        leftover
    }
}

struct SessionWorker {
    config: BurstConfig,
    controller: BurstController,
    directory: Box<dyn DeviceDirectory>,
    driver: Box<dyn DeviceDriver>,
    storage: Box<dyn Storage>,
    notifier: FinishNotifier,
    events: Receiver<WorkerEvent>,
    sender: EventSender,
    translator: TimestampTranslator,
    sink: ImageSink,
    resources: SessionResources,
    torn_down: bool,
    images_seen: u32,
    persisted: u32,
    dropped: u64,
}

impl SessionWorker {
    fn new(
        config: BurstConfig,
        directory: Box<dyn DeviceDirectory>,
        driver: Box<dyn DeviceDriver>,
        storage: Box<dyn Storage>,
        notifier: FinishNotifier,
        events: Receiver<WorkerEvent>,
        sender: EventSender,
    ) -> Self {
        let controller = BurstController::new(config.controller_config());
        let sink = ImageSink::new(config.sink);
        Self {
            config,
            controller,
            directory,
            driver,
            storage,
            notifier,
            events,
            sender,
            translator: TimestampTranslator::unavailable(),
            sink,
            resources: SessionResources::default(),
            torn_down: false,
            images_seen: 0,
            persisted: 0,
            dropped: 0,
        }
    }

    fn run(mut self) -> SessionOutcome {
        let deadline = Instant::now() + self.config.deadline();
        self.translator = TimestampTranslator::from_driver(self.driver.as_ref());
        match self.translator.epoch() {
            Some(epoch) => debug!(epoch = %format_utc(&epoch), "device clock epoch"),
            None => warn!("device clock unavailable, file names use arrival time"),
        }

        self.open_rear_device();

        let events = self.events.clone();
        while !self.controller.state().is_terminal() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            crossbeam_channel::select! {
                recv(events) -> message => match message {
                    Ok(event) => self.dispatch(event),
                    Err(_) => self.feed(ControllerEvent::Fault(CaptureError::DeviceDisconnected)),
                },
                recv(crossbeam_channel::after(remaining)) -> _ => {
                    warn!(deadline_ms = self.config.deadline_ms, "session deadline elapsed");
                    self.feed(ControllerEvent::Fault(CaptureError::Timeout));
                },
            }
        }

        if self.controller.state() == &BurstState::Closed {
            self.linger();
        }
        self.teardown();

        let outcome = self.outcome();
        self.notifier.notify(&outcome);
        outcome
    }

    fn open_rear_device(&mut self) {
        let devices = self.directory.list_devices();
        let Some(descriptor) = devices.iter().find(|device| device.facing == Facing::Back) else {
            error!(listed = devices.len(), "no back camera found");
            self.feed(ControllerEvent::Fault(CaptureError::NoDeviceFound));
            return;
        };

        info!(device = %descriptor.id, "opening device");
        if let Err(err) = self.driver.open(&descriptor.id, self.sender.clone()) {
            self.feed(ControllerEvent::Fault(err));
        }
    }

    fn dispatch(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::TeardownRequested => {
                info!(state = %self.controller.state(), "teardown requested by host");
                self.feed(ControllerEvent::Fault(CaptureError::TeardownRequested));
            }
            WorkerEvent::Device(event) => self.on_device_event(event),
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Opened(device) => self.on_opened(device),
            DeviceEvent::OpenFailed(reason) => {
                self.feed(ControllerEvent::Fault(CaptureError::DeviceOpenFailed(reason)));
            }
            DeviceEvent::SessionConfigured(session) => {
                self.resources.session = Some(session);
                self.feed(ControllerEvent::SessionReady);
            }
            DeviceEvent::ConfigureFailed(reason) => {
                self.feed(ControllerEvent::Fault(CaptureError::SessionConfigFailed(reason)));
            }
            DeviceEvent::PreviewResult(mut frame) => {
                self.log_frame("preview", &frame);
                if let Some(image) = frame.image.take() {
                    self.accept_image(image);
                }
                self.feed(ControllerEvent::PreviewFrame(&frame));
            }
            DeviceEvent::CaptureResult(mut frame) => {
                self.log_frame("capture", &frame);
                if let Some(image) = frame.image.take() {
                    self.accept_image(image);
                }
                self.feed(ControllerEvent::CaptureCompleted(frame.sequence));
            }
            DeviceEvent::ImageAvailable(image) => self.accept_image(image),
            DeviceEvent::Disconnected => {
                self.feed(ControllerEvent::Fault(CaptureError::DeviceDisconnected));
            }
            DeviceEvent::Error(code) => {
                self.feed(ControllerEvent::Fault(CaptureError::DeviceError(code)));
            }
        }
    }

    fn on_opened(&mut self, mut device: Box<dyn Device>) {
        info!(device = device.id(), "device opened");

        let settings = self.config.still_settings();
        let templates = match RequestTemplateCache::build(device.as_mut(), settings) {
            Ok(templates) => templates,
            Err(err) => {
                self.resources.device = Some(device);
                self.feed(ControllerEvent::Fault(err));
                return;
            }
        };

        let format = self.config.image_format;
        let still_size = device
            .output_sizes(format)
            .into_iter()
            .max_by_key(|size| size.area())
            .unwrap_or(self.config.fallback_still_size);
        info!(
            width = still_size.width,
            height = still_size.height,
            ?format,
            "still output size"
        );

        let preview_target = OutputTarget {
            kind: OutputKind::Preview,
            size: self.config.preview_size,
            format: None,
            max_images: 1,
        };
        let image_target = OutputTarget {
            kind: OutputKind::Image,
            size: still_size,
            format: Some(format),
            max_images: self.config.max_images(),
        };
        let configured = device.create_session(&[preview_target.clone(), image_target.clone()]);

        self.resources.device = Some(device);
        self.resources.templates = Some(templates);
        self.resources.preview_target = Some(preview_target);
        self.resources.image_target = Some(image_target);

        if let Err(err) = configured {
            self.feed(ControllerEvent::Fault(err));
        }
    }

    fn accept_image(&mut self, image: Image) {
        self.images_seen += 1;
        self.sink.offer(image);
        let report = self.sink.flush(
            self.storage.as_ref(),
            &self.translator,
            self.config.image_format.extension(),
        );
        self.persisted += report.persisted;
        self.dropped += u64::from(report.failed);
    }

    /// Run one event through the controller and execute the resulting commands.
    fn feed(&mut self, event: ControllerEvent<'_>) {
        let mut commands: VecDeque<Command> = self.controller.handle(event).into();
        while let Some(command) = commands.pop_front() {
            if let Some(follow_up) = self.execute(command) {
                commands.extend(self.controller.handle(follow_up));
            }
        }
    }

    fn execute(&mut self, command: Command) -> Option<ControllerEvent<'static>> {
        if command == Command::Teardown {
            debug!("teardown scheduled");
            return None;
        }

        let resources = &mut self.resources;
        let (Some(session), Some(templates)) =
            (resources.session.as_mut(), resources.templates.as_ref())
        else {
            return Some(ControllerEvent::Fault(CaptureError::CaptureSubmitFailed(
                format!("{command:?} without an active session"),
            )));
        };

        let result = match command {
            Command::StartPreview => {
                let started = session.set_repeating(templates.preview());
                resources.repeating = started.is_ok();
                started.map(|()| None)
            }
            Command::StopPreview => {
                let stopped = session.stop_repeating();
                resources.repeating = stopped.is_err();
                stopped.map(|()| Some(ControllerEvent::PreviewStopped))
            }
            Command::SubmitBurst(count) => session
                .submit_batch(&templates.still_batch(count))
                .map(|()| None),
            Command::SubmitCapture { frame } => {
                debug!(frame, "submitting still");
                session.submit(templates.still()).map(|()| None)
            }
            Command::Abort => {
                if session.supports_abort() {
                    if let Err(err) = session.abort() {
                        warn!(error = %err, "abort failed, closing instead");
                    }
                } else {
                    warn!("session cannot abort, closing instead");
                }
                Ok(None)
            }
            Command::Teardown => Ok(None),
        };

        result.unwrap_or_else(|err| Some(ControllerEvent::Fault(submit_failure(err))))
    }

    /// Keep persisting late images for a short while after a completed burst.
    fn linger(&mut self) {
        let until = Instant::now() + self.config.linger();
        let expected = self.controller.config().burst_count;
        let events = self.events.clone();

        while self.images_seen < expected {
            let remaining = until.saturating_duration_since(Instant::now());
            crossbeam_channel::select! {
                recv(events) -> message => match message {
                    Ok(WorkerEvent::Device(DeviceEvent::ImageAvailable(image))) => {
                        self.accept_image(image);
                    }
                    Ok(WorkerEvent::Device(
                        DeviceEvent::CaptureResult(mut frame) | DeviceEvent::PreviewResult(mut frame),
                    )) => {
                        if let Some(image) = frame.image.take() {
                            self.accept_image(image);
                        }
                    }
                    Ok(WorkerEvent::TeardownRequested) | Err(_) => return,
                    Ok(WorkerEvent::Device(other)) => debug!(?other, "ignored while lingering"),
                },
                recv(crossbeam_channel::after(remaining)) -> _ => return,
            }
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!(state = %self.controller.state(), "tearing down");

        self.dropped += self.resources.release(&mut self.sink);
        self.dropped += self.sink.discarded();

        // Handles that arrived after the loop ended still need closing.
        while let Ok(event) = self.events.try_recv() {
            match event {
                WorkerEvent::Device(DeviceEvent::Opened(mut device)) => device.close(),
                WorkerEvent::Device(DeviceEvent::SessionConfigured(mut session)) => session.close(),
                other => debug!(?other, "discarded after teardown"),
            }
        }
    }

    fn outcome(&self) -> SessionOutcome {
        match self.controller.state() {
            BurstState::Closed => SessionOutcome::Completed {
                captured: self.controller.completed_count(),
                persisted: self.persisted,
                dropped: self.dropped,
            },
            BurstState::Failed(reason) => SessionOutcome::Failed(reason.clone()),
            _ => SessionOutcome::Failed(CaptureError::TeardownRequested),
        }
    }

    fn log_frame(&self, kind: &str, frame: &Frame) {
        let utc = self
            .translator
            .translate(frame.timestamp_ns)
            .map(|utc| format_utc(&utc));
        debug!(
            kind,
            frame = frame.sequence,
            ae = %frame.exposure,
            awb = %frame.white_balance,
            af = %frame.focus,
            time = ?frame.timestamp_ns,
            utc = utc.as_deref().unwrap_or("-"),
            "capture result"
        );
    }
}

fn submit_failure(err: CaptureError) -> CaptureError {
    match err {
        CaptureError::CaptureSubmitFailed(_)
        | CaptureError::DeviceDisconnected
        | CaptureError::DeviceError(_) => err,
        other => CaptureError::CaptureSubmitFailed(other.to_string()),
    }
}
