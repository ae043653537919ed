/// End-to-end workflow runs against the simulated rig.

use std::path::Path;

use film_scanner::arduino_connection::{Direction, StepSize};
use film_scanner::scan_journal::{read_journal, ScanJournal};
use film_scanner::scanner_state::{Mode, ScannerState, StateStore};
use film_scanner::simulated::SimulatedRig;
use film_scanner::status::CalibrationPhase;
use film_scanner::workflow::{
    restore_state, CalibrateAction, ControllerParts, ScannerController, StripAction, WorkflowError,
};

const FINE: i64 = 10;
const COARSE: i64 = 50;

fn parts(rig: &SimulatedRig, root: &Path, journal: ScanJournal) -> ControllerParts {
    ControllerParts {
        transport: Box::new(rig.transport(FINE, COARSE)),
        camera: Box::new(rig.camera()),
        store: StateStore::new(root),
        journal,
        fine_step: FINE,
        coarse_step: COARSE,
        default_advance: 1200,
    }
}

fn connected(rig: &SimulatedRig, root: &Path) -> ScannerController {
    let c = ScannerController::new(parts(rig, root, ScanJournal::disabled()), ScannerState::default());
    c.connect_arduino().unwrap();
    c
}

fn forward(c: &ScannerController, size: StepSize) -> i64 {
    c.move_film(Direction::Forward, size).unwrap()
}

/// Open a roll and calibrate one coarse step per frame; leaves the film at `COARSE`.
fn calibrated(rig: &SimulatedRig, root: &Path, roll: &str) -> ScannerController {
    let c = connected(rig, root);
    c.new_roll(roll, false).unwrap();
    c.calibrate(CalibrateAction::CaptureFrame1, None).unwrap();
    forward(&c, StepSize::Coarse);
    assert_eq!(c.capture_frame2(None).unwrap(), COARSE);
    c
}

#[test]
fn test_full_roll_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());

    c.new_roll("TestRoll", false).unwrap();
    assert_eq!(c.capture().unwrap(), 1);
    assert_eq!(c.state().frame_count, 1);

    c.start_calibration().unwrap();
    forward(&c, StepSize::Coarse);
    forward(&c, StepSize::Coarse);
    assert_eq!(c.capture_frame1().unwrap(), 100);
    assert_eq!(forward(&c, StepSize::Coarse), 150);
    assert_eq!(c.capture_frame2(None).unwrap(), 50);

    let state = c.state();
    assert_eq!(state.frame_advance, Some(50));
    assert_eq!(state.mode, Mode::Calibrated);
    assert_eq!(c.status().calibration, CalibrationPhase::Idle);

    assert_eq!(c.capture().unwrap(), 2);
    let state = c.state();
    assert_eq!(state.position, 200);
    assert_eq!(state.frame_count, 2);
    assert_eq!(state.frame_positions, vec![0, 150]);
}

#[test]
fn test_move_positions_sum_signed_steps() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());

    let moves = [
        (Direction::Forward, StepSize::Fine),
        (Direction::Forward, StepSize::Coarse),
        (Direction::Backward, StepSize::Fine),
        (Direction::Backward, StepSize::Coarse),
        (Direction::Backward, StepSize::Coarse),
        (Direction::Forward, StepSize::Fine),
    ];
    let mut expected = 0;
    for (direction, size) in moves {
        let step = match size {
            StepSize::Fine => FINE,
            StepSize::Coarse => COARSE,
        };
        expected += direction.sign() * step;
        assert_eq!(c.move_film(direction, size).unwrap(), expected);
    }
    assert_eq!(rig.position(), expected);

    c.update_step_sizes(3, 30).unwrap();
    assert_eq!(forward(&c, StepSize::Fine), expected + 3);
}

#[test]
fn test_calibration_backwards_fails_without_changing_mode() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Backwards", false).unwrap();

    forward(&c, StepSize::Coarse);
    c.start_calibration().unwrap();
    c.capture_frame1().unwrap();
    c.move_film(Direction::Backward, StepSize::Fine).unwrap();
    assert_eq!(c.capture_frame2(None), Err(WorkflowError::NonPositiveAdvance(-FINE)));

    let status = c.status();
    assert_eq!(status.state.mode, Mode::Manual);
    assert_eq!(status.state.frame_advance, None);
    assert_eq!(status.calibration, CalibrationPhase::AwaitingFrame2);

    // Same position as frame 1 is not an advance either
    forward(&c, StepSize::Fine);
    assert_eq!(c.capture_frame2(None), Err(WorkflowError::NonPositiveAdvance(0)));
    forward(&c, StepSize::Fine);
    assert_eq!(c.capture_frame2(None), Ok(FINE));
}

#[test]
fn test_capture_happens_before_advance() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Order", false).unwrap();
    c.calibrate(CalibrateAction::CaptureFrame1, None).unwrap();
    forward(&c, StepSize::Coarse);
    c.calibrate(CalibrateAction::CaptureFrame2, None).unwrap();

    c.capture().unwrap();
    c.capture().unwrap();
    let calls = rig.calls();
    let tail = &calls[calls.len() - 4..];
    assert_eq!(tail, ["capture@50", "H50", "capture@100", "H50"]);
}

#[test]
fn test_failed_capture_does_not_advance_or_count() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Faults", false).unwrap();
    c.calibrate(CalibrateAction::CaptureFrame1, None).unwrap();
    forward(&c, StepSize::Coarse);
    c.calibrate(CalibrateAction::CaptureFrame2, None).unwrap();

    rig.fail_next_capture();
    assert!(matches!(c.capture(), Err(WorkflowError::Capture(_))));
    assert_eq!(c.state().frame_count, 0);
    assert_eq!(rig.position(), 50);

    rig.fail_next_move();
    assert!(matches!(c.capture(), Err(WorkflowError::Transport(_))));
    assert_eq!(c.state().frame_count, 0);
}

#[test]
fn test_test_capture_never_counts() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Test", false).unwrap();
    c.capture().unwrap();

    c.test_capture().unwrap();
    rig.fail_next_capture();
    assert!(c.test_capture().is_err());
    rig.set_camera_present(false);
    assert_eq!(c.test_capture(), Err(WorkflowError::CameraNotConnected));

    let state = c.state();
    assert_eq!((state.frame_count, state.frames_in_strip), (1, 1));
}

#[test]
fn test_new_roll_resets_counters() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("First", false).unwrap();
    c.calibrate(CalibrateAction::CaptureFrame1, None).unwrap();
    forward(&c, StepSize::Coarse);
    c.calibrate(CalibrateAction::CaptureFrame2, None).unwrap();
    c.new_strip(StripAction::Start).unwrap();
    c.new_strip(StripAction::CaptureFirst).unwrap();
    c.capture().unwrap();
    c.close_roll().unwrap();

    c.new_roll("Second", false).unwrap();
    let state = c.state();
    assert_eq!((state.frame_count, state.strip_count, state.frames_in_strip), (0, 0, 0));
    assert_eq!(state.frame_advance, None);
    assert_eq!(state.mode, Mode::Manual);
    assert_eq!(state.position, rig.position());
}

#[test]
fn test_strip_flow() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Strips", false).unwrap();
    assert_eq!(c.new_strip(StripAction::CaptureFirst), Err(WorkflowError::StripNotStarted));

    c.new_strip(StripAction::Start).unwrap();
    assert!(c.status().strip_pending);
    c.new_strip(StripAction::CaptureFirst).unwrap();
    c.capture().unwrap();
    c.new_strip(StripAction::Start).unwrap();
    c.new_strip(StripAction::CaptureFirst).unwrap();

    let status = c.status();
    assert!(!status.strip_pending);
    assert_eq!(status.state.strip_count, 2);
    assert_eq!(status.state.frames_in_strip, 1);
    assert_eq!(status.state.frame_count, 3);
}

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let before = {
        let c = connected(&rig, dir.path());
        c.new_roll("Persist", false).unwrap();
        forward(&c, StepSize::Coarse);
        c.capture().unwrap();
        c.toggle_step_size().unwrap();
        c.state()
    };

    let c = ScannerController::restore(parts(&rig, dir.path(), ScanJournal::disabled()));
    assert_eq!(c.state(), before);
    assert_eq!(c.new_roll("Other", false), Err(WorkflowError::RollAlreadyActive("Persist".to_string())));
}

#[test]
fn test_closed_roll_is_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    {
        let c = connected(&rig, dir.path());
        c.new_roll("Done", false).unwrap();
        forward(&c, StepSize::Coarse);
        c.capture().unwrap();
        c.close_roll().unwrap();
    }
    let restored = restore_state(&StateStore::new(dir.path()));
    assert_eq!(restored.roll_name, None);
    assert_eq!(restored.frame_count, 0);
    assert_eq!(restored.position, COARSE);
}

#[test]
fn test_resume_roll_reloads_counters() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Again", false).unwrap();
    c.capture().unwrap();
    c.capture().unwrap();
    c.close_roll().unwrap();

    c.new_roll("Again", true).unwrap();
    let state = c.state();
    assert_eq!(state.frame_count, 2);
    assert!(!state.closed);
}

#[test]
fn test_corrupt_state_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("2024-03-01").join("Broken");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(StateStore::state_path(&folder), "{\"roll_name\": ").unwrap();
    assert_eq!(restore_state(&StateStore::new(dir.path())), ScannerState::default());
}

#[test]
fn test_mutations_reach_every_observer() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    let mut a = c.subscribe();
    let mut b = c.subscribe();

    c.new_roll("Watched", false).unwrap();
    c.capture().unwrap();
    for rx in [&mut a, &mut b] {
        assert_eq!(rx.try_recv().unwrap().state.frame_count, 0);
        assert_eq!(rx.try_recv().unwrap().state.frame_count, 1);
    }
}

#[test]
fn test_journal_records_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = ScannerController::new(parts(&rig, dir.path(), ScanJournal::new()), ScannerState::default());
    c.connect_arduino().unwrap();
    c.new_roll("Logged", false).unwrap();
    c.capture().unwrap();
    let folder = c.state().roll_folder.unwrap();
    drop(c);

    let events = read_journal(&folder).unwrap();
    let kinds: Vec<_> = events.iter().map(|e| (e.event_type.as_str(), e.status.as_str())).collect();
    assert_eq!(kinds, vec![("roll", "started"), ("capture", "completed")]);
}

#[test]
fn test_frame_jumps_follow_frame_advance() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Jumps", false).unwrap();
    assert_eq!(c.advance_frame(), Err(WorkflowError::NotCalibrated));
    assert_eq!(c.backup_frame(), Err(WorkflowError::NotCalibrated));
    assert_eq!(rig.position(), 0);
    drop(c);

    let c = calibrated(&rig, dir.path(), "Jumps2");
    assert_eq!(c.advance_frame().unwrap(), 2 * COARSE);
    assert_eq!(c.backup_frame().unwrap(), COARSE);
    assert_eq!(c.backup_frame().unwrap(), 0);
    assert_eq!(c.state().frame_count, 0);

    assert_eq!(c.toggle_mode(), Ok(Mode::Manual));
    assert_eq!(c.advance_frame(), Err(WorkflowError::NotCalibrated));
    assert_eq!(c.backup_frame(), Err(WorkflowError::NotCalibrated));
    assert_eq!((rig.position(), c.state().position), (0, 0));
}

#[test]
fn test_capture_without_auto_advance_stays_put() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = calibrated(&rig, dir.path(), "InPlace");
    assert!(c.state().auto_advance);
    assert_eq!(c.toggle_auto_advance(), Ok(false));
    assert!(!restore_state(&StateStore::new(dir.path())).auto_advance);

    let before = rig.calls().len();
    assert_eq!(c.capture().unwrap(), 1);
    assert_eq!(c.capture().unwrap(), 2);
    let calls = rig.calls();
    assert_eq!(&calls[before..], ["capture@50", "capture@50"]);
    assert_eq!(rig.position(), COARSE);
    assert_eq!(c.state().frame_positions, vec![COARSE, COARSE]);

    assert_eq!(c.toggle_auto_advance(), Ok(true));
    c.capture().unwrap();
    assert_eq!(rig.position(), 2 * COARSE);
}

#[test]
fn test_auto_advance_ignored_in_manual_mode() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Manual", false).unwrap();
    assert!(c.state().auto_advance);
    forward(&c, StepSize::Fine);
    c.capture().unwrap();
    c.capture().unwrap();
    assert_eq!(rig.position(), FINE);
    drop(c);

    // Calibrated once, then switched back to manual
    let c = calibrated(&rig, dir.path(), "Manual2");
    assert_eq!(c.toggle_mode(), Ok(Mode::Manual));
    let position = rig.position();
    c.capture().unwrap();
    assert_eq!(rig.position(), position);
    assert!(!rig.calls().iter().any(|call| call.starts_with('H')));
}

#[test]
fn test_zero_position_clears_frame_positions() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = calibrated(&rig, dir.path(), "Zeroed");
    c.capture().unwrap();
    assert_eq!(c.state().frame_positions, vec![COARSE]);

    c.zero_position().unwrap();
    let state = c.state();
    assert_eq!((state.position, rig.position()), (0, 0));
    assert!(state.frame_positions.is_empty());
    assert_eq!(state.frame_count, 1);
    assert_eq!(rig.calls().last().map(String::as_str), Some("Z"));
    assert!(restore_state(&StateStore::new(dir.path())).frame_positions.is_empty());
}

#[test]
fn test_failed_save_leaves_counters_alone() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = connected(&rig, dir.path());
    c.new_roll("Unwritable", false).unwrap();
    assert_eq!(c.capture().unwrap(), 1);

    // A plain file where the roll folder should be makes every save fail
    let folder = c.state().roll_folder.unwrap();
    std::fs::remove_dir_all(&folder).unwrap();
    std::fs::write(&folder, "").unwrap();

    assert!(matches!(c.capture(), Err(WorkflowError::Persistence(_))));
    assert!(matches!(c.toggle_auto_advance(), Err(WorkflowError::Persistence(_))));
    assert!(matches!(c.new_strip(StripAction::Start), Err(WorkflowError::Persistence(_))));
    c.start_calibration().unwrap();
    c.capture_frame1().unwrap();
    assert!(matches!(c.move_film(Direction::Forward, StepSize::Coarse), Err(WorkflowError::Persistence(_))));
    assert!(matches!(c.capture_frame2(None), Err(WorkflowError::Persistence(_))));

    let status = c.status();
    assert!(status.status_msg.starts_with('✗'));
    assert_eq!((status.state.frame_count, status.state.frames_in_strip, status.state.strip_count), (1, 1, 1));
    assert_eq!(status.state.frame_positions, vec![0]);
    assert!(status.state.auto_advance);
    assert!(!status.strip_pending);
    assert_eq!(status.state.mode, Mode::Manual);
    assert_eq!(status.state.frame_advance, None);
    assert_eq!(status.calibration, CalibrationPhase::AwaitingFrame2);
    // The film did move, so the position follows the hardware
    assert_eq!(status.state.position, rig.position());

    std::fs::remove_file(&folder).unwrap();
    assert_eq!(c.capture_frame2(None), Ok(COARSE));
    assert_eq!(c.capture(), Ok(2));
}

#[test]
fn test_step_sizes_reach_the_firmware() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    let c = ScannerController::new(parts(&rig, dir.path(), ScanJournal::disabled()), ScannerState::default());
    assert!(rig.calls().is_empty());

    c.connect_arduino().unwrap();
    assert_eq!(rig.calls(), ["m10", "l50"]);

    c.update_step_sizes(3, 30).unwrap();
    let calls = rig.calls();
    assert_eq!(&calls[2..], ["m3", "l30"]);
    assert_eq!(c.status().fine_step, 3);
    assert_eq!(forward(&c, StepSize::Fine), 3);
    assert_eq!(forward(&c, StepSize::Coarse), 33);
}

#[test]
fn test_position_between_rolls_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let rig = SimulatedRig::new();
    {
        let c = connected(&rig, dir.path());
        c.new_roll("Earlier", false).unwrap();
        c.capture().unwrap();
        c.close_roll().unwrap();
        forward(&c, StepSize::Coarse);
        forward(&c, StepSize::Coarse);
        c.toggle_step_size().unwrap();
    }

    let restored = restore_state(&StateStore::new(dir.path()));
    assert_eq!(restored.roll_name, None);
    assert_eq!(restored.position, 2 * COARSE);
    assert!(restored.is_large_step);

    let c = ScannerController::restore(parts(&rig, dir.path(), ScanJournal::disabled()));
    assert_eq!(c.state().position, 2 * COARSE);
    c.new_roll("Later", false).unwrap();
    assert_eq!(c.state().position, 2 * COARSE);
}
