//! Convergence-gated burst state machine.
//!
//! The controller is a pure transition function: every device callback is
//! fed in as a [`ControllerEvent`] and the controller answers with the
//! [`Command`]s the session worker must execute. It never touches the
//! device itself, so the same logic is driven by hardware callbacks in
//! production and by plain function calls in tests.
//!
//! ```text
//! Idle -> Previewing -> Triggered -> CapturingBurst -> Draining -> Closed
//!   \__________\____________\______________\______________\-----> Failed
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::convergence::ConvergencePolicy;
use crate::error::CaptureError;
use crate::traits::Frame;

/// How the burst is issued once convergence triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BurstMode {
    /// All stills submitted as one batch.
    #[default]
    Plain,
    /// One zero-shutter-lag still per preview frame after convergence.
    Windowed,
}

/// Fixed per-session controller parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Burst variant.
    pub mode: BurstMode,
    /// Stills to capture (N).
    pub burst_count: u32,
    /// Preview frames after convergence eligible to trigger a windowed still.
    pub window_size: u32,
    /// Axes that must converge.
    pub policy: ConvergencePolicy,
    /// Whether the observed convergence flag clears when a later frame regresses.
    pub resettable: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: BurstMode::Plain,
            burst_count: 5,
            window_size: 5,
            policy: ConvergencePolicy::Exposure,
            resettable: false,
        }
    }
}

/// Controller lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BurstState {
    /// Waiting for the session to be configured.
    Idle,
    /// Repeating preview armed, watching for convergence.
    Previewing,
    /// Convergence detected, preview being stopped.
    Triggered,
    /// Burst in flight, or windowed stills being issued.
    CapturingBurst,
    /// All stills issued, waiting for completions.
    Draining,
    /// Burst complete.
    Closed,
    /// Session ended on a fatal error.
    Failed(CaptureError),
}

impl BurstState {
    /// Whether no further transitions are possible.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

impl fmt::Display for BurstState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Previewing => f.write_str("Previewing"),
            Self::Triggered => f.write_str("Triggered"),
            Self::CapturingBurst => f.write_str("CapturingBurst"),
            Self::Draining => f.write_str("Draining"),
            Self::Closed => f.write_str("Closed"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Input to the state machine.
#[derive(Debug)]
pub enum ControllerEvent<'a> {
    /// The capture session is configured.
    SessionReady,
    /// Metadata for one repeating preview frame.
    PreviewFrame(&'a Frame),
    /// The repeating preview request was stopped.
    PreviewStopped,
    /// A still capture completed with this frame number.
    CaptureCompleted(u64),
    /// A fatal error from the device, the session, or the deadline.
    Fault(CaptureError),
}

/// Action the session worker must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Arm the repeating preview request.
    StartPreview,
    /// Stop the repeating preview request, then report `PreviewStopped`.
    StopPreview,
    /// Submit this many still requests as one batch.
    SubmitBurst(u32),
    /// Submit one still request for the given preview frame.
    SubmitCapture {
        /// Preview frame number that triggered this still.
        frame: u64,
    },
    /// Discard in-flight device work if the session supports it.
    Abort,
    /// Close the session and release every resource.
    Teardown,
}

/// Burst orchestration state, mutated only by [`BurstController::handle`].
#[derive(Debug)]
pub struct BurstController {
    config: ControllerConfig,
    state: BurstState,
    converged_at: Option<u64>,
    converged: bool,
    burst_fired: bool,
    triggered: u32,
    completed: u32,
    completed_frames: HashSet<u64>,
    last_preview: Option<u64>,
}

impl BurstController {
    /// Create an idle controller.
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            state: BurstState::Idle,
            converged_at: None,
            converged: false,
            burst_fired: false,
            triggered: 0,
            completed: 0,
            completed_frames: HashSet::new(),
            last_preview: None,
        }
    }

    /// Current state.
    pub const fn state(&self) -> &BurstState {
        &self.state
    }

    /// Parameters this controller was built with.
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Frame number at which convergence first triggered the burst.
    pub const fn converged_at(&self) -> Option<u64> {
        self.converged_at
    }

    /// Whether the most recent preview frames satisfied the policy.
    pub const fn is_converged(&self) -> bool {
        self.converged
    }

    /// Whether convergence has already triggered a burst.
    pub const fn burst_fired(&self) -> bool {
        self.burst_fired
    }

    /// Still requests issued so far.
    pub const fn triggered_count(&self) -> u32 {
        self.triggered
    }

    /// Distinct capture completions observed so far.
    pub const fn completed_count(&self) -> u32 {
        self.completed
    }

    /// Apply one event and return the commands it requires.
    pub fn handle(&mut self, event: ControllerEvent<'_>) -> Vec<Command> {
        if self.state.is_terminal() {
            trace!(state = %self.state, ?event, "ignoring event after terminal state");
            return Vec::new();
        }

        match event {
            ControllerEvent::SessionReady => self.on_session_ready(),
            ControllerEvent::PreviewFrame(frame) => self.on_preview_frame(frame),
            ControllerEvent::PreviewStopped => self.on_preview_stopped(),
            ControllerEvent::CaptureCompleted(frame) => self.on_capture_completed(frame),
            ControllerEvent::Fault(reason) => self.fail(reason),
        }
    }

    fn transition(&mut self, next: BurstState) {
        info!(from = %self.state, to = %next, "burst state");
        self.state = next;
    }

    fn fail(&mut self, reason: CaptureError) -> Vec<Command> {
        error!(state = %self.state, error = %reason, "session failed");
        self.transition(BurstState::Failed(reason));
        vec![Command::Teardown]
    }

    fn on_session_ready(&mut self) -> Vec<Command> {
        if self.state != BurstState::Idle {
            warn!(state = %self.state, "session ready outside Idle");
            return Vec::new();
        }
        self.transition(BurstState::Previewing);
        vec![Command::StartPreview]
    }

    fn on_preview_frame(&mut self, frame: &Frame) -> Vec<Command> {
        if let Some(last) = self.last_preview {
            if frame.sequence <= last {
                warn!(frame = frame.sequence, last, "out-of-order preview frame ignored");
                return Vec::new();
            }
        }
        self.last_preview = Some(frame.sequence);

        let acceptable = self.config.policy.evaluate(frame);
        if acceptable {
            self.converged = true;
        } else if self.config.resettable && self.converged {
            debug!(frame = frame.sequence, "convergence regressed");
            self.converged = false;
        }

        match self.state {
            BurstState::Previewing if acceptable && !self.burst_fired => {
                self.trigger(frame.sequence)
            }
            BurstState::CapturingBurst if self.config.mode == BurstMode::Windowed => {
                self.issue_windowed(frame.sequence)
            }
            _ => Vec::new(),
        }
    }

    fn trigger(&mut self, frame: u64) -> Vec<Command> {
        self.burst_fired = true;
        if self.converged_at.is_none() {
            self.converged_at = Some(frame);
        }
        info!(
            frame,
            policy = self.config.policy.label(),
            "converged, triggering burst"
        );
        self.transition(BurstState::Triggered);
        vec![Command::StopPreview]
    }

    fn on_preview_stopped(&mut self) -> Vec<Command> {
        if self.state != BurstState::Triggered {
            debug!(state = %self.state, "preview stop outside Triggered");
            return Vec::new();
        }
        self.transition(BurstState::CapturingBurst);

        match self.config.mode {
            BurstMode::Plain => {
                self.triggered = self.config.burst_count;
                info!(count = self.triggered, "submitting burst");
                self.transition(BurstState::Draining);
                vec![Command::SubmitBurst(self.triggered)]
            }
            BurstMode::Windowed => {
                if let Some(converged_at) = self.converged_at {
                    info!(
                        first = converged_at + 1,
                        last = converged_at + u64::from(self.config.window_size),
                        "zero-shutter-lag window open"
                    );
                }
                Vec::new()
            }
        }
    }

    fn issue_windowed(&mut self, frame: u64) -> Vec<Command> {
        let Some(converged_at) = self.converged_at else {
            return Vec::new();
        };
        let first = converged_at + 1;
        let last = converged_at + u64::from(self.config.window_size);
        if !(first..=last).contains(&frame) || self.triggered >= self.config.burst_count {
            trace!(frame, first, last, "preview frame outside capture window");
            return Vec::new();
        }

        self.triggered += 1;
        info!(
            frame,
            issued = self.triggered,
            total = self.config.burst_count,
            "triggering zero-shutter-lag capture"
        );
        if self.triggered == self.config.burst_count {
            self.transition(BurstState::Draining);
        }
        vec![Command::SubmitCapture { frame }]
    }

    fn on_capture_completed(&mut self, frame: u64) -> Vec<Command> {
        if !matches!(
            self.state,
            BurstState::CapturingBurst | BurstState::Draining
        ) {
            warn!(frame, state = %self.state, "capture completion before burst");
            return Vec::new();
        }
        if self.completed >= self.triggered {
            warn!(frame, "capture completion without an outstanding request");
            return Vec::new();
        }
        if !self.completed_frames.insert(frame) {
            warn!(frame, "duplicate capture completion ignored");
            return Vec::new();
        }

        self.completed += 1;
        info!(
            frame,
            completed = self.completed,
            total = self.config.burst_count,
            "capture completed"
        );

        if self.completed < self.config.burst_count || self.state != BurstState::Draining {
            return Vec::new();
        }

        self.transition(BurstState::Closed);
        match self.config.mode {
            BurstMode::Plain => vec![Command::Teardown],
            BurstMode::Windowed => vec![Command::Abort, Command::Teardown],
        }
    }
}
