/// Film transport link
///
/// The transport Arduino speaks a line-oriented ASCII protocol: one command
/// per line, `?` answered with a status block that contains `Position: <n>`.
/// The connection is owned by the workflow controller; nothing else in the
/// process talks to the port.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// Ports probed on a Raspberry Pi even when enumeration does not list them.
const PI_PORTS: [&str; 4] = ["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/serial0", "/dev/ttyAMA0"];

/// Substrings of the firmware banner / status reply that identify the scanner.
const BANNER_MARKERS: [&str; 5] = ["Film", "READY", "STATUS", "NEMA", "Position"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepSize {
    #[default]
    Fine,
    Coarse,
}

/// Commands understood by the transport firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCommand {
    Jog { direction: Direction, size: StepSize },
    Relative(i64),
    Zero,
    Query,
}

impl MotorCommand {
    /// Wire form, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            MotorCommand::Jog { direction: Direction::Forward, size: StepSize::Fine } => "f".to_string(),
            MotorCommand::Jog { direction: Direction::Backward, size: StepSize::Fine } => "b".to_string(),
            MotorCommand::Jog { direction: Direction::Forward, size: StepSize::Coarse } => "F".to_string(),
            MotorCommand::Jog { direction: Direction::Backward, size: StepSize::Coarse } => "B".to_string(),
            MotorCommand::Relative(steps) => format!("H{}", steps),
            MotorCommand::Zero => "Z".to_string(),
            MotorCommand::Query => "?".to_string(),
        }
    }

    /// Position after this command if the firmware moved exactly as asked.
    pub fn apply_nominal(&self, position: i64, fine_step: i64, coarse_step: i64) -> i64 {
        match *self {
            MotorCommand::Jog { direction, size } => {
                let step = match size {
                    StepSize::Fine => fine_step,
                    StepSize::Coarse => coarse_step,
                };
                position + direction.sign() * step
            }
            MotorCommand::Relative(steps) => position + steps,
            MotorCommand::Zero => 0,
            MotorCommand::Query => position,
        }
    }
}

/// Extract `Position: <n>` from a status reply.
pub fn parse_position(reply: &str) -> Option<i64> {
    reply
        .lines()
        .filter(|line| line.contains("Position"))
        .find_map(|line| line.split(':').nth(1).and_then(|v| v.trim().parse::<i64>().ok()))
}

pub fn is_scanner_banner(reply: &str) -> bool {
    BANNER_MARKERS.iter().any(|m| reply.contains(m))
}

/// Lines that set the firmware's fine (`m`) and coarse (`l`) jog distances.
pub fn step_size_commands(fine_step: i64, coarse_step: i64) -> [String; 2] {
    [format!("m{}", fine_step), format!("l{}", coarse_step)]
}

/// Motor link used by the workflow controller
pub trait Transport: Send {
    fn connect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn port_name(&self) -> Option<String>;
    /// Send `command` and return the resulting position. `position` is the
    /// caller's last known position, used when the firmware reports none.
    fn send(&mut self, command: MotorCommand, position: i64) -> Result<i64>;
    /// Change the jog distances. A connected link forwards them to the
    /// firmware right away, otherwise on the next `connect`.
    fn set_step_sizes(&mut self, fine_step: i64, coarse_step: i64) -> Result<()>;
}

/// Serial connection to the transport Arduino
pub struct ArduinoConnection {
    port: Option<Box<dyn serialport::SerialPort>>,
    port_path: Option<String>, // configured port; None means probe
    connected_path: Option<String>,
    baud: u32,
    reset_delay: Duration,
    command_timeout: Duration,
    fine_step: i64,
    coarse_step: i64,
}

impl std::fmt::Debug for ArduinoConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArduinoConnection")
            .field("port_path", &self.port_path)
            .field("connected_path", &self.connected_path)
            .field("baud", &self.baud)
            .finish()
    }
}

impl ArduinoConnection {
    pub fn new(
        port_path: Option<String>,
        baud: u32,
        reset_delay: Duration,
        command_timeout: Duration,
        fine_step: i64,
        coarse_step: i64,
    ) -> Self {
        Self {
            port: None,
            port_path,
            connected_path: None,
            baud,
            reset_delay,
            command_timeout,
            fine_step,
            coarse_step,
        }
    }

    /// Configured port if any, else every enumerated port plus the usual Pi devices.
    fn candidate_ports(&self) -> Vec<String> {
        if let Some(p) = &self.port_path {
            return vec![p.clone()];
        }
        let mut ports: Vec<String> = serialport::available_ports()
            .map(|list| list.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default();
        for p in PI_PORTS.iter() {
            if Path::new(p).exists() && !ports.iter().any(|q| q == p) {
                ports.push(p.to_string());
            }
        }
        ports
    }

    fn open_and_probe(&self, path: &str) -> Result<Box<dyn serialport::SerialPort>> {
        let mut port = serialport::new(path, self.baud)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| format!("Failed to open {} at {} baud", path, self.baud))?;

        std::thread::sleep(self.reset_delay); // Arduino resets when the port opens
        let _ = port.clear(serialport::ClearBuffer::Input);
        port.write_all(b"?\n")?;
        port.flush()?;
        let reply = read_reply(&mut *port, self.command_timeout.max(Duration::from_millis(800)))?;
        if is_scanner_banner(&reply) {
            Ok(port)
        } else {
            Err(anyhow!("{} did not answer like the scanner firmware: {:?}", path, reply.trim()))
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let port = self.port.as_mut().ok_or_else(|| anyhow!("Arduino not connected"))?;
        log::debug!(target: "arduino", ">>> {}", line);
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn push_step_sizes(&mut self) -> Result<()> {
        for line in step_size_commands(self.fine_step, self.coarse_step) {
            self.write_line(&line)?;
        }
        Ok(())
    }

    fn drop_port(&mut self) {
        self.port = None;
        self.connected_path = None;
    }
}

/// Read until a `Position` line is complete or `timeout` passes.
fn read_reply(port: &mut dyn serialport::SerialPort, timeout: Duration) -> Result<String> {
    let mut buffer = Vec::new();
    let start_time = Instant::now();
    while start_time.elapsed() < timeout {
        let mut chunk = [0u8; 256];
        match port.read(&mut chunk) {
            Ok(bytes_read) if bytes_read > 0 => {
                buffer.extend_from_slice(&chunk[..bytes_read]);
                let text = String::from_utf8_lossy(&buffer);
                if text.contains("Position") && text.ends_with('\n') {
                    break;
                }
            }
            Ok(_) => std::thread::sleep(Duration::from_millis(10)),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(anyhow!("Read error: {}", e)),
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

impl Transport for ArduinoConnection {
    fn connect(&mut self) -> Result<()> {
        self.drop_port();
        let candidates = self.candidate_ports();
        if candidates.is_empty() {
            return Err(anyhow!("No serial ports found"));
        }
        let mut last_err = None;
        for path in candidates {
            match self.open_and_probe(&path) {
                Ok(port) => {
                    log::info!(target: "arduino", "Arduino found on {}", path);
                    self.port = Some(port);
                    self.connected_path = Some(path);
                    if let Err(e) = self.push_step_sizes() {
                        self.drop_port();
                        return Err(e.context("Failed to send step sizes"));
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::debug!(target: "arduino", "Probe of {} failed: {:#}", path, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("Arduino not found")))
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn port_name(&self) -> Option<String> {
        self.connected_path.clone()
    }

    fn send(&mut self, command: MotorCommand, position: i64) -> Result<i64> {
        if self.port.is_none() {
            return Err(anyhow!("Arduino not connected"));
        }
        if let Some(p) = self.port.as_mut() {
            let _ = p.clear(serialport::ClearBuffer::Input);
        }
        let nominal = command.apply_nominal(position, self.fine_step, self.coarse_step);

        let result = (|| -> Result<Option<i64>> {
            if command != MotorCommand::Query {
                self.write_line(&command.encode())?;
                std::thread::sleep(self.command_timeout); // let the move finish
            }
            self.write_line(&MotorCommand::Query.encode())?;
            let port = self.port.as_mut().ok_or_else(|| anyhow!("Arduino not connected"))?;
            let reply = read_reply(&mut **port, self.command_timeout.max(Duration::from_millis(300)))?;
            log::debug!(target: "arduino", "<<< {}", reply.trim());
            Ok(parse_position(&reply))
        })();

        match result {
            Ok(Some(reported)) => {
                if reported != nominal {
                    log::debug!(target: "arduino", "Firmware reports {} (expected {})", reported, nominal);
                }
                Ok(reported)
            }
            Ok(None) => {
                log::warn!(target: "arduino", "No position in reply to {:?} - assuming {}", command, nominal);
                Ok(nominal)
            }
            Err(e) => {
                if let Some(io) = e.downcast_ref::<std::io::Error>() {
                    if io.kind() == std::io::ErrorKind::BrokenPipe {
                        self.drop_port();
                    }
                }
                Err(e.context(format!("Command {:?} failed", command.encode())))
            }
        }
    }

    fn set_step_sizes(&mut self, fine_step: i64, coarse_step: i64) -> Result<()> {
        self.fine_step = fine_step;
        self.coarse_step = coarse_step;
        if self.port.is_some() {
            self.push_step_sizes()?;
        }
        Ok(())
    }
}
