/// In-process stand-ins for the transport Arduino and the camera.
///
/// Both halves share one `SimulatedRig` so a caller holding a clone can watch
/// the physical position, count captures, read the ordered call log, and
/// inject failures while the controller owns the boxed devices.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::arduino_connection::{step_size_commands, MotorCommand, Transport};
use crate::camera::{CaptureDevice, CaptureOutcome};

/// Smallest well-formed JPEG: SOI, APP0 stub, EOI.
pub const PLACEHOLDER_JPEG: [u8; 6] = [0xFF, 0xD8, 0xFF, 0xE0, 0xFF, 0xD9];

#[derive(Debug)]
pub struct RigState {
    pub arduino_present: bool,
    pub arduino_connected: bool,
    pub camera_present: bool,
    pub position: i64,
    pub captures: u32,
    pub fail_next_move: bool,
    pub fail_next_capture: bool,
    /// Motor commands as sent on the wire, captures as `capture@<position>`.
    pub calls: Vec<String>,
}

impl Default for RigState {
    fn default() -> Self {
        Self {
            arduino_present: true,
            arduino_connected: false,
            camera_present: true,
            position: 0,
            captures: 0,
            fail_next_move: false,
            fail_next_capture: false,
            calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedRig {
    inner: Arc<Mutex<RigState>>,
}

impl SimulatedRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, RigState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transport(&self, fine_step: i64, coarse_step: i64) -> SimulatedTransport {
        SimulatedTransport { rig: self.clone(), fine_step, coarse_step }
    }

    pub fn camera(&self) -> SimulatedCamera {
        SimulatedCamera { rig: self.clone(), connected: false }
    }

    pub fn position(&self) -> i64 {
        self.lock().position
    }

    pub fn captures(&self) -> u32 {
        self.lock().captures
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn set_camera_present(&self, present: bool) {
        self.lock().camera_present = present;
    }

    pub fn set_arduino_present(&self, present: bool) {
        let mut rig = self.lock();
        rig.arduino_present = present;
        if !present {
            rig.arduino_connected = false;
        }
    }

    pub fn fail_next_move(&self) {
        self.lock().fail_next_move = true;
    }

    pub fn fail_next_capture(&self) {
        self.lock().fail_next_capture = true;
    }
}

/// Transport that moves exactly as commanded
#[derive(Debug)]
pub struct SimulatedTransport {
    rig: SimulatedRig,
    fine_step: i64,
    coarse_step: i64,
}

impl Transport for SimulatedTransport {
    fn connect(&mut self) -> Result<()> {
        let mut rig = self.rig.lock();
        if !rig.arduino_present {
            return Err(anyhow!("Arduino not found"));
        }
        rig.arduino_connected = true;
        rig.calls.extend(step_size_commands(self.fine_step, self.coarse_step));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.rig.lock().arduino_connected
    }

    fn port_name(&self) -> Option<String> {
        self.is_connected().then(|| "simulated".to_string())
    }

    fn send(&mut self, command: MotorCommand, _position: i64) -> Result<i64> {
        let mut rig = self.rig.lock();
        if !rig.arduino_connected {
            return Err(anyhow!("Arduino not connected"));
        }
        if rig.fail_next_move {
            rig.fail_next_move = false;
            return Err(anyhow!("Simulated motor fault on {:?}", command.encode()));
        }
        if command != MotorCommand::Query {
            rig.calls.push(command.encode());
        }
        rig.position = command.apply_nominal(rig.position, self.fine_step, self.coarse_step);
        Ok(rig.position)
    }

    fn set_step_sizes(&mut self, fine_step: i64, coarse_step: i64) -> Result<()> {
        self.fine_step = fine_step;
        self.coarse_step = coarse_step;
        let mut rig = self.rig.lock();
        if rig.arduino_connected {
            rig.calls.extend(step_size_commands(fine_step, coarse_step));
        }
        Ok(())
    }
}

/// Camera that always captures unless told otherwise
#[derive(Debug)]
pub struct SimulatedCamera {
    rig: SimulatedRig,
    connected: bool,
}

impl CaptureDevice for SimulatedCamera {
    fn detect(&mut self, _force: bool) -> bool {
        self.connected = self.rig.lock().camera_present;
        self.connected
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn model(&self) -> String {
        if self.connected { "Simulated camera".to_string() } else { "Not detected".to_string() }
    }

    fn capture(&mut self) -> Result<CaptureOutcome> {
        let mut rig = self.rig.lock();
        if !rig.camera_present {
            return Err(anyhow!("Camera not connected"));
        }
        if rig.fail_next_capture {
            rig.fail_next_capture = false;
            return Err(anyhow!("Simulated capture failure"));
        }
        rig.captures += 1;
        let position = rig.position;
        rig.calls.push(format!("capture@{}", position));
        Ok(CaptureOutcome { detail: format!("/store_00020001/DCIM/100CANON/SIM_{:04}.CR3", rig.captures) })
    }

    fn autofocus(&mut self) -> Result<()> {
        let mut rig = self.rig.lock();
        if !rig.camera_present {
            return Err(anyhow!("Camera not connected"));
        }
        rig.calls.push("autofocus".to_string());
        Ok(())
    }

    fn preview(&mut self) -> Result<Vec<u8>> {
        if !self.rig.lock().camera_present {
            return Err(anyhow!("Camera not connected"));
        }
        Ok(PLACEHOLDER_JPEG.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arduino_connection::{Direction, StepSize};

    #[test]
    fn test_transport_requires_connect() {
        let rig = SimulatedRig::new();
        let mut t = rig.transport(8, 64);
        assert!(t.send(MotorCommand::Zero, 0).is_err());
        t.connect().unwrap();
        let pos = t.send(MotorCommand::Jog { direction: Direction::Forward, size: StepSize::Coarse }, 0).unwrap();
        assert_eq!(pos, 64);
        assert_eq!(rig.position(), 64);
        assert_eq!(rig.calls(), vec!["m8", "l64", "F"]);
    }

    #[test]
    fn test_step_sizes_reach_connected_rig() {
        let rig = SimulatedRig::new();
        let mut t = rig.transport(8, 64);
        t.set_step_sizes(4, 40).unwrap();
        assert!(rig.calls().is_empty());
        t.connect().unwrap();
        t.set_step_sizes(5, 50).unwrap();
        assert_eq!(rig.calls(), vec!["m4", "l40", "m5", "l50"]);
        let pos = t.send(MotorCommand::Jog { direction: Direction::Backward, size: StepSize::Fine }, 0).unwrap();
        assert_eq!(pos, -5);
    }

    #[test]
    fn test_injected_failures_are_one_shot() {
        let rig = SimulatedRig::new();
        let mut cam = rig.camera();
        rig.fail_next_capture();
        assert!(cam.capture().is_err());
        assert!(cam.capture().is_ok());
        assert_eq!(rig.captures(), 1);
    }
}
