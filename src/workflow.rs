/// Workflow controller for the film scanner
///
/// Owns the scanner state, the transport link, the camera, the state store
/// and the scan journal behind a single mutex. Every operation holds the lock
/// for its whole validate → hardware → mutate → persist path, so two operators
/// can never interleave motor or camera commands. After each operation the
/// resulting snapshot is published to all observers.

use std::sync::{Mutex, MutexGuard};

use chrono::{Local, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::arduino_connection::{Direction, MotorCommand, StepSize, Transport};
use crate::camera::CaptureDevice;
use crate::scan_journal::{ScanEvent, ScanJournal};
use crate::scanner_state::{validate_roll_name, Mode, ScannerState, StateStore};
use crate::status::{CalibrationPhase, StatusHub, StatusSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("Create roll first")]
    NoActiveRoll,
    #[error("Roll '{0}' is still open - close it first")]
    RollAlreadyActive(String),
    #[error("{0}")]
    InvalidRollName(&'static str),
    #[error("Calibrate first")]
    NotCalibrated,
    #[error("Calibration step out of order (expected {expected:?}, currently {actual:?})")]
    CalibrationState { expected: CalibrationPhase, actual: CalibrationPhase },
    #[error("Frame 2 must be ahead of frame 1 (advance would be {0} steps)")]
    NonPositiveAdvance(i64),
    #[error("Start a new strip first")]
    StripNotStarted,
    #[error("Step sizes must be positive")]
    InvalidStepSize,
    #[error("Arduino not connected")]
    ArduinoNotConnected,
    #[error("Camera not connected")]
    CameraNotConnected,
    #[error("Motor command failed: {0}")]
    Transport(String),
    #[error("Capture failed: {0}")]
    Capture(String),
    #[error("Could not save state: {0}")]
    Persistence(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StripAction {
    #[default]
    Start,
    CaptureFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrateAction {
    #[default]
    Start,
    CaptureFrame1,
    CaptureFrame2,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationReply {
    pub frame1_pos: Option<i64>,
    pub frame_advance: Option<i64>,
}

/// Everything the controller needs besides its initial state.
pub struct ControllerParts {
    pub transport: Box<dyn Transport>,
    pub camera: Box<dyn CaptureDevice>,
    pub store: StateStore,
    pub journal: ScanJournal,
    pub fine_step: i64,
    pub coarse_step: i64,
    /// Expected frame advance; calibrations far from it are logged.
    pub default_advance: i64,
}

/// Load the last persisted state, or start fresh. A corrupt file is not fatal.
/// Without an open roll the idle file, written on every change outside a
/// roll, wins over the closed roll it followed.
pub fn restore_state(store: &StateStore) -> ScannerState {
    let fallback = match store.load_latest() {
        Ok(Some(state)) if !state.closed => {
            info!(target: "workflow", "Resuming roll {:?}: frame {} strip {} position {}",
                  state.roll_name, state.frame_count, state.strip_count, state.position);
            return state;
        }
        Ok(Some(state)) => {
            info!(target: "workflow", "Last roll {:?} was closed", state.roll_name);
            state.after_close()
        }
        Ok(None) => ScannerState::default(),
        Err(e) => {
            warn!(target: "workflow", "{:#} - starting fresh", e);
            ScannerState::default()
        }
    };
    match store.load_idle() {
        Ok(Some(idle)) => {
            info!(target: "workflow", "No open roll - keeping position {}", idle.position);
            idle.after_close()
        }
        Ok(None) => fallback,
        Err(e) => {
            warn!(target: "workflow", "{:#} - ignoring idle state", e);
            fallback
        }
    }
}

struct ControllerInner {
    state: ScannerState,
    calibration: CalibrationPhase,
    frame1_pos: Option<i64>,
    strip_pending: bool,
    status_msg: String,
    fine_step: i64,
    coarse_step: i64,
    default_advance: i64,
    transport: Box<dyn Transport>,
    camera: Box<dyn CaptureDevice>,
    store: StateStore,
    journal: ScanJournal,
}

impl ControllerInner {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state.clone(),
            calibration: self.calibration,
            frame1_pos: self.frame1_pos,
            strip_pending: self.strip_pending,
            fine_step: self.fine_step,
            coarse_step: self.coarse_step,
            arduino_connected: self.transport.is_connected(),
            arduino_port: self.transport.port_name(),
            camera_connected: self.camera.is_connected(),
            camera_model: self.camera.model(),
            status_msg: self.status_msg.clone(),
        }
    }

    /// Persist the current state. Only for changes that already happened
    /// physically, such as a new transport position.
    fn commit(&mut self) -> WorkflowResult<()> {
        let next = self.state.clone();
        self.commit_state(next)
    }

    /// Persist `next` and adopt it. On failure the in-memory state is untouched.
    fn commit_state(&mut self, mut next: ScannerState) -> WorkflowResult<()> {
        next.updated = Some(Utc::now());
        self.store
            .save(&next)
            .map_err(|e| WorkflowError::Persistence(format!("{:#}", e)))?;
        self.state = next;
        self.save_idle();
        Ok(())
    }

    /// Outside a roll the state lives in the idle file so a restart keeps the position.
    fn save_idle(&self) {
        if self.state.has_roll() {
            return;
        }
        if let Err(e) = self.store.save_idle(&self.state) {
            warn!(target: "workflow", "Could not save idle state: {:#}", e);
        }
    }

    fn journal(&self, event_type: &str, status: &str, message: impl Into<String>) {
        if let (Some(roll_name), Some(folder)) = (&self.state.roll_name, &self.state.roll_folder) {
            self.journal.record(folder, ScanEvent {
                recorded_at: Utc::now(),
                roll_name: roll_name.clone(),
                event_type: event_type.to_string(),
                status: status.to_string(),
                message: message.into(),
                position: self.state.position,
                frame_count: self.state.frame_count,
                strip_count: self.state.strip_count,
            });
        }
    }

    fn require_roll(&self) -> WorkflowResult<()> {
        if self.state.has_roll() { Ok(()) } else { Err(WorkflowError::NoActiveRoll) }
    }

    fn require_arduino(&self) -> WorkflowResult<()> {
        if self.transport.is_connected() { Ok(()) } else { Err(WorkflowError::ArduinoNotConnected) }
    }

    fn require_camera(&mut self) -> WorkflowResult<()> {
        if self.camera.detect(false) { Ok(()) } else { Err(WorkflowError::CameraNotConnected) }
    }

    fn require_calibrated(&self) -> WorkflowResult<i64> {
        match (self.state.mode, self.state.frame_advance) {
            (Mode::Calibrated, Some(advance)) => Ok(advance),
            _ => Err(WorkflowError::NotCalibrated),
        }
    }

    /// Send a motor command and fold the reported position into the state.
    fn motor(&mut self, command: MotorCommand) -> WorkflowResult<i64> {
        self.require_arduino()?;
        let position = self.transport
            .send(command, self.state.position)
            .map_err(|e| WorkflowError::Transport(format!("{:#}", e)))?;
        debug!(target: "workflow", "{} -> position {}", command.encode(), position);
        self.state.position = position;
        Ok(position)
    }

    fn shutter(&mut self) -> WorkflowResult<String> {
        self.camera
            .capture()
            .map(|outcome| outcome.detail)
            .map_err(|e| WorkflowError::Capture(format!("{:#}", e)))
    }

    /// Capture one counted frame. In calibrated mode with auto-advance the film
    /// is moved by one frame after the shutter fires; counters only change once
    /// both steps succeeded.
    fn capture_counted(&mut self) -> WorkflowResult<u32> {
        let advance = match (self.state.mode, self.state.auto_advance, self.state.frame_advance) {
            (Mode::Calibrated, true, Some(advance)) => Some(advance),
            _ => None,
        };
        if advance.is_some() {
            self.require_arduino()?;
        }
        let captured_at = self.state.position;

        let result = self.shutter().and_then(|detail| {
            if let Some(steps) = advance {
                self.motor(MotorCommand::Relative(steps))?;
            }
            Ok(detail)
        });
        let detail = match result {
            Ok(detail) => detail,
            Err(e) => {
                self.journal("capture", "failed", e.to_string());
                return Err(e);
            }
        };

        let mut next = self.state.clone();
        if next.strip_count == 0 {
            next.strip_count = 1;
        }
        next.frame_count += 1;
        next.frames_in_strip += 1;
        next.frame_positions.push(captured_at);
        if let Err(e) = self.commit_state(next) {
            self.journal("capture", "failed", e.to_string());
            return Err(e);
        }
        self.strip_pending = false;
        self.journal("capture", "completed", detail);
        info!(target: "workflow", "Frame {} captured at {} (strip {})", self.state.frame_count, captured_at, self.state.strip_count);
        Ok(self.state.frame_count)
    }

    fn start_calibration(&mut self) -> WorkflowResult<()> {
        self.require_roll()?;
        self.calibration = CalibrationPhase::AwaitingFrame1;
        self.frame1_pos = None;
        self.status_msg = "Calibration: position frame 1 and capture".to_string();
        self.journal("calibration", "started", "");
        Ok(())
    }

    fn capture_frame1(&mut self) -> WorkflowResult<i64> {
        self.require_roll()?;
        if self.calibration != CalibrationPhase::AwaitingFrame1 {
            return Err(WorkflowError::CalibrationState {
                expected: CalibrationPhase::AwaitingFrame1,
                actual: self.calibration,
            });
        }
        self.require_camera()?;
        let frame1_pos = self.state.position;
        self.shutter()?;
        self.frame1_pos = Some(frame1_pos);
        self.calibration = CalibrationPhase::AwaitingFrame2;
        self.status_msg = format!("Frame 1 at {} - move to frame 2 and capture", frame1_pos);
        self.journal("calibration", "frame1", format!("frame 1 at {}", frame1_pos));
        Ok(frame1_pos)
    }

    fn capture_frame2(&mut self, frame1_hint: Option<i64>) -> WorkflowResult<i64> {
        self.require_roll()?;
        match (self.calibration, frame1_hint) {
            (CalibrationPhase::Idle, Some(hint)) => {
                // Client still holds frame 1 from before a restart
                info!(target: "workflow", "Resuming calibration with client frame 1 at {}", hint);
                self.calibration = CalibrationPhase::AwaitingFrame2;
                self.frame1_pos = Some(hint);
            }
            (CalibrationPhase::AwaitingFrame2, Some(hint)) if Some(hint) != self.frame1_pos => {
                debug!(target: "workflow", "Ignoring client frame 1 {} in favour of {:?}", hint, self.frame1_pos);
            }
            _ => {}
        }
        let frame1_pos = match (self.calibration, self.frame1_pos) {
            (CalibrationPhase::AwaitingFrame2, Some(pos)) => pos,
            (actual, _) => {
                return Err(WorkflowError::CalibrationState {
                    expected: CalibrationPhase::AwaitingFrame2,
                    actual,
                })
            }
        };

        let advance = self.state.position - frame1_pos;
        if advance <= 0 {
            return Err(WorkflowError::NonPositiveAdvance(advance));
        }
        self.require_camera()?;
        self.shutter()?;

        if advance > self.default_advance * 2 || advance * 2 < self.default_advance {
            warn!(target: "workflow", "Frame advance {} is far from the expected {} steps", advance, self.default_advance);
        }
        let mut next = self.state.clone();
        next.frame_advance = Some(advance);
        next.mode = Mode::Calibrated;
        self.commit_state(next)?;
        self.calibration = CalibrationPhase::Idle;
        self.frame1_pos = None;
        self.status_msg = format!("✓ Calibrated: {} steps/frame", advance);
        self.journal("calibration", "completed", format!("{} steps/frame", advance));
        info!(target: "workflow", "Calibrated: frame advance {} steps", advance);
        Ok(advance)
    }

    fn cancel_calibration(&mut self) {
        if self.calibration != CalibrationPhase::Idle {
            self.journal("calibration", "cancelled", "");
        }
        self.calibration = CalibrationPhase::Idle;
        self.frame1_pos = None;
        self.status_msg = "Calibration cancelled".to_string();
    }
}

/// Coordinates the transport, the camera and the scanner state
pub struct ScannerController {
    inner: Mutex<ControllerInner>,
    hub: StatusHub,
}

impl ScannerController {
    pub fn new(parts: ControllerParts, initial: ScannerState) -> Self {
        let status_msg = match &initial.roll_name {
            Some(name) => format!("Resumed: {}", name),
            None => "Ready".to_string(),
        };
        let mut transport = parts.transport;
        if let Err(e) = transport.set_step_sizes(parts.fine_step, parts.coarse_step) {
            warn!(target: "workflow", "Step sizes not applied: {:#}", e);
        }
        Self {
            inner: Mutex::new(ControllerInner {
                state: initial,
                calibration: CalibrationPhase::Idle,
                frame1_pos: None,
                strip_pending: false,
                status_msg,
                fine_step: parts.fine_step,
                coarse_step: parts.coarse_step,
                default_advance: parts.default_advance,
                transport,
                camera: parts.camera,
                store: parts.store,
                journal: parts.journal,
            }),
            hub: StatusHub::new(),
        }
    }

    /// Build a controller from the most recent persisted state.
    pub fn restore(parts: ControllerParts) -> Self {
        let initial = restore_state(&parts.store);
        Self::new(parts, initial)
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` under the lock, record failures in the status message, then publish.
    fn run<T>(&self, op: &str, f: impl FnOnce(&mut ControllerInner) -> WorkflowResult<T>) -> WorkflowResult<T> {
        let mut inner = self.lock();
        let result = f(&mut inner);
        if let Err(e) = &result {
            warn!(target: "workflow", "{} failed: {}", op, e);
            inner.status_msg = format!("✗ {}", e);
        }
        let snapshot = inner.snapshot();
        drop(inner);
        self.hub.publish(snapshot);
        result
    }

    pub fn hub(&self) -> &StatusHub {
        &self.hub
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.hub.subscribe()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.lock().snapshot()
    }

    /// Re-check the camera and return a snapshot for the requesting client only.
    pub fn refresh_status(&self) -> StatusSnapshot {
        let mut inner = self.lock();
        inner.camera.detect(false);
        inner.snapshot()
    }

    pub fn state(&self) -> ScannerState {
        self.lock().state.clone()
    }

    pub fn connect_arduino(&self) -> WorkflowResult<()> {
        self.run("connect_arduino", |inner| {
            inner.transport
                .connect()
                .map_err(|e| WorkflowError::Transport(format!("{:#}", e)))?;
            match inner.motor(MotorCommand::Query) {
                Ok(position) => debug!(target: "workflow", "Transport reports position {}", position),
                Err(e) => warn!(target: "workflow", "Connected but position query failed: {}", e),
            }
            inner.commit()?;
            inner.status_msg = format!("Arduino connected ({})", inner.transport.port_name().unwrap_or_default());
            Ok(())
        })
    }

    pub fn new_roll(&self, roll_name: &str, resume: bool) -> WorkflowResult<()> {
        self.run("new_roll", |inner| {
            let name = validate_roll_name(roll_name).map_err(WorkflowError::InvalidRollName)?.to_string();
            if let Some(active) = &inner.state.roll_name {
                return Err(WorkflowError::RollAlreadyActive(active.clone()));
            }
            let folder = inner.store.roll_folder(Local::now().date_naive(), &name);
            let state_path = StateStore::state_path(&folder);

            let resumed = resume && state_path.exists();
            let next = if resumed {
                let mut loaded = StateStore::load(&state_path)
                    .map_err(|e| WorkflowError::Persistence(format!("{:#}", e)))?;
                loaded.roll_name = Some(name.clone());
                loaded.roll_folder = Some(folder);
                loaded.closed = false;
                loaded.position = inner.state.position; // the transport has not moved since
                loaded
            } else {
                let mut next = inner.state.clone();
                next.begin_roll(&name, folder);
                next
            };
            inner.commit_state(next)?;
            inner.calibration = CalibrationPhase::Idle;
            inner.frame1_pos = None;
            inner.strip_pending = false;
            inner.status_msg = if resumed { format!("Resumed: {}", name) } else { format!("New roll: {}", name) };
            inner.journal("roll", "started", inner.status_msg.clone());
            info!(target: "workflow", "{}", inner.status_msg);
            Ok(())
        })
    }

    pub fn close_roll(&self) -> WorkflowResult<()> {
        self.run("close_roll", |inner| {
            inner.require_roll()?;
            let name = inner.state.roll_name.clone().unwrap_or_default();
            let mut next = inner.state.clone();
            next.closed = true;
            inner.commit_state(next)?;
            inner.journal("roll", "closed", format!("{} frames in {} strips", inner.state.frame_count, inner.state.strip_count));
            inner.state = inner.state.after_close();
            inner.save_idle();
            inner.calibration = CalibrationPhase::Idle;
            inner.frame1_pos = None;
            inner.strip_pending = false;
            inner.status_msg = format!("Closed roll: {}", name);
            Ok(())
        })
    }

    pub fn new_strip(&self, action: StripAction) -> WorkflowResult<()> {
        self.run("new_strip", |inner| {
            inner.require_roll()?;
            match action {
                StripAction::Start => {
                    let mut next = inner.state.clone();
                    next.strip_count += 1;
                    next.frames_in_strip = 0;
                    inner.commit_state(next)?;
                    inner.strip_pending = true;
                    inner.status_msg = format!("Strip {} loaded - position frame 1 and capture", inner.state.strip_count);
                    inner.journal("strip", "started", "");
                }
                StripAction::CaptureFirst => {
                    if !inner.strip_pending {
                        return Err(WorkflowError::StripNotStarted);
                    }
                    inner.require_camera()?;
                    inner.capture_counted()?;
                    inner.status_msg = format!("✓ Strip {} started", inner.state.strip_count);
                }
            }
            Ok(())
        })
    }

    pub fn move_film(&self, direction: Direction, size: StepSize) -> WorkflowResult<i64> {
        self.run("move", |inner| {
            let position = inner.motor(MotorCommand::Jog { direction, size })?;
            inner.commit()?;
            let steps = match size {
                StepSize::Fine => inner.fine_step,
                StepSize::Coarse => inner.coarse_step,
            };
            let arrow = match direction {
                Direction::Forward => "→",
                Direction::Backward => "←",
            };
            inner.status_msg = format!("{} {} steps", arrow, steps);
            Ok(position)
        })
    }

    pub fn advance_frame(&self) -> WorkflowResult<i64> {
        self.run("advance_frame", |inner| {
            let advance = inner.require_calibrated()?;
            let position = inner.motor(MotorCommand::Relative(advance))?;
            inner.commit()?;
            inner.status_msg = format!("Advanced {} steps", advance);
            Ok(position)
        })
    }

    pub fn backup_frame(&self) -> WorkflowResult<i64> {
        self.run("backup_frame", |inner| {
            let advance = inner.require_calibrated()?;
            let position = inner.motor(MotorCommand::Relative(-advance))?;
            inner.commit()?;
            inner.status_msg = format!("Backed up {} steps", advance);
            Ok(position)
        })
    }

    pub fn capture(&self) -> WorkflowResult<u32> {
        self.run("capture", |inner| {
            inner.require_roll()?;
            inner.require_camera()?;
            let frame = inner.capture_counted()?;
            inner.status_msg = format!("✓ Frame {} (Strip {})", frame, inner.state.strip_count);
            Ok(frame)
        })
    }

    /// Fire the shutter without touching any counter.
    pub fn test_capture(&self) -> WorkflowResult<String> {
        self.run("test_capture", |inner| {
            inner.require_camera()?;
            let detail = inner.shutter()?;
            inner.status_msg = "✓ Test capture OK".to_string();
            Ok(detail)
        })
    }

    pub fn start_calibration(&self) -> WorkflowResult<()> {
        self.run("start_calibration", |inner| inner.start_calibration())
    }

    pub fn capture_frame1(&self) -> WorkflowResult<i64> {
        self.run("capture_frame1", |inner| inner.capture_frame1())
    }

    pub fn capture_frame2(&self, frame1_hint: Option<i64>) -> WorkflowResult<i64> {
        self.run("capture_frame2", |inner| inner.capture_frame2(frame1_hint))
    }

    pub fn cancel_calibration(&self) {
        let _ = self.run("cancel_calibration", |inner| {
            inner.cancel_calibration();
            Ok(())
        });
    }

    /// Calibration entry point for clients that only send capture actions:
    /// `capture_frame1` from idle starts the calibration first.
    pub fn calibrate(&self, action: CalibrateAction, frame1_pos: Option<i64>) -> WorkflowResult<CalibrationReply> {
        self.run("calibrate", |inner| match action {
            CalibrateAction::Start => {
                inner.start_calibration()?;
                Ok(CalibrationReply::default())
            }
            CalibrateAction::CaptureFrame1 => {
                if inner.calibration == CalibrationPhase::Idle {
                    inner.start_calibration()?;
                }
                let pos = inner.capture_frame1()?;
                Ok(CalibrationReply { frame1_pos: Some(pos), frame_advance: None })
            }
            CalibrateAction::CaptureFrame2 => {
                let advance = inner.capture_frame2(frame1_pos)?;
                Ok(CalibrationReply { frame1_pos: None, frame_advance: Some(advance) })
            }
            CalibrateAction::Cancel => {
                inner.cancel_calibration();
                Ok(CalibrationReply::default())
            }
        })
    }

    pub fn toggle_mode(&self) -> WorkflowResult<Mode> {
        self.run("toggle_mode", |inner| {
            let next = match inner.state.mode {
                Mode::Manual if inner.state.frame_advance.is_none() => return Err(WorkflowError::NotCalibrated),
                Mode::Manual => Mode::Calibrated,
                Mode::Calibrated => Mode::Manual,
            };
            let mut state = inner.state.clone();
            state.mode = next;
            inner.commit_state(state)?;
            inner.status_msg = format!("Mode: {}", next.as_str().to_uppercase());
            Ok(next)
        })
    }

    pub fn toggle_auto_advance(&self) -> WorkflowResult<bool> {
        self.run("toggle_auto_advance", |inner| {
            let mut next = inner.state.clone();
            next.auto_advance = !next.auto_advance;
            inner.commit_state(next)?;
            let on = inner.state.auto_advance;
            inner.status_msg = match inner.state.mode {
                Mode::Calibrated => format!("Auto-advance: {}", if on { "ON" } else { "OFF" }),
                Mode::Manual => format!("Auto-advance: {} (applies in calibrated mode)", if on { "ON" } else { "OFF" }),
            };
            Ok(on)
        })
    }

    pub fn toggle_step_size(&self) -> WorkflowResult<bool> {
        self.run("toggle_step_size", |inner| {
            let mut next = inner.state.clone();
            next.is_large_step = !next.is_large_step;
            inner.commit_state(next)?;
            inner.status_msg = format!("Step size: {}", if inner.state.is_large_step { "LARGE" } else { "small" });
            Ok(inner.state.is_large_step)
        })
    }

    pub fn zero_position(&self) -> WorkflowResult<()> {
        self.run("zero_position", |inner| {
            inner.motor(MotorCommand::Zero)?;
            let mut next = inner.state.clone();
            next.frame_positions.clear();
            inner.commit_state(next)?;
            inner.status_msg = "Position zeroed".to_string();
            Ok(())
        })
    }

    pub fn update_step_sizes(&self, fine_step: i64, coarse_step: i64) -> WorkflowResult<()> {
        self.run("update_step_sizes", |inner| {
            if fine_step <= 0 || coarse_step <= 0 {
                return Err(WorkflowError::InvalidStepSize);
            }
            inner.transport
                .set_step_sizes(fine_step, coarse_step)
                .map_err(|e| WorkflowError::Transport(format!("{:#}", e)))?;
            inner.fine_step = fine_step;
            inner.coarse_step = coarse_step;
            inner.status_msg = format!("Step sizes: fine {} / coarse {}", fine_step, coarse_step);
            Ok(())
        })
    }

    pub fn autofocus(&self) -> WorkflowResult<()> {
        self.run("autofocus", |inner| {
            inner.require_camera()?;
            inner.camera
                .autofocus()
                .map_err(|e| WorkflowError::Capture(format!("{:#}", e)))?;
            inner.status_msg = "Focused".to_string();
            Ok(())
        })
    }

    /// One live-view JPEG. Not broadcast: clients poll this.
    pub fn get_preview(&self) -> WorkflowResult<Vec<u8>> {
        let mut inner = self.lock();
        inner.require_camera()?;
        inner.camera
            .preview()
            .map_err(|e| WorkflowError::Capture(format!("{:#}", e)))
    }
}
