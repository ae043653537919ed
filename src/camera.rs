/// Capture link: drives the camera through the gphoto2 command-line tool.
///
/// Every invocation is a short-lived subprocess bounded by a timeout. gvfs and
/// earlier gphoto2 runs tend to keep the USB device claimed, so stale gphoto2
/// processes are killed first when `kill_stale` is set.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Time the lens needs after `autofocus=1` before a capture.
const FOCUS_SETTLE: Duration = Duration::from_millis(1500);
const DETECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIG_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a successful full capture
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureOutcome {
    /// Last line gphoto2 printed, usually the new file's path on the card.
    pub detail: String,
}

/// Camera operations used by the workflow controller
pub trait CaptureDevice: Send {
    /// Refresh the connection flag. Cached results are reused unless `force`.
    fn detect(&mut self, force: bool) -> bool;
    fn is_connected(&self) -> bool;
    fn model(&self) -> String;
    fn capture(&mut self) -> Result<CaptureOutcome>;
    fn autofocus(&mut self) -> Result<()>;
    /// One live-view frame as JPEG bytes.
    fn preview(&mut self) -> Result<Vec<u8>>;
}

/// Pull the camera model out of `gphoto2 --auto-detect` output.
pub fn parse_auto_detect(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .skip(2) // "Model   Port" header and dashes
        .find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower.find("usb").map(|idx| line[..idx].trim().to_string())
        })
}

/// Strip anything before the JPEG start-of-image marker.
pub fn extract_jpeg(bytes: &[u8]) -> Option<&[u8]> {
    bytes
        .windows(2)
        .position(|w| w == [0xFF, 0xD8])
        .map(|start| &bytes[start..])
}

/// Run `program args..` and wait at most `timeout`; the child is killed on expiry.
pub fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<Output> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;

    // Drain pipes on their own threads so a large preview cannot fill the pipe and stall the child
    let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("{} stdout unavailable", program))?;
    let mut stderr = child.stderr.take().ok_or_else(|| anyhow!("{} stderr unavailable", program))?;
    let out_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let err_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let start_time = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start_time.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("{} {} timed out after {:?}", program, args.join(" "), timeout));
        }
        thread::sleep(Duration::from_millis(20));
    };

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    Ok(Output { status, stdout, stderr })
}

/// gphoto2-backed camera
#[derive(Debug)]
pub struct Gphoto2Camera {
    binary: String,
    capture_timeout: Duration,
    preview_timeout: Duration,
    check_interval: Duration,
    kill_stale: bool,
    last_check: Option<Instant>,
    connected: bool,
    model: String,
}

impl Gphoto2Camera {
    pub fn new(
        binary: String,
        capture_timeout: Duration,
        preview_timeout: Duration,
        check_interval: Duration,
        kill_stale: bool,
    ) -> Self {
        Self {
            binary,
            capture_timeout,
            preview_timeout,
            check_interval,
            kill_stale,
            last_check: None,
            connected: false,
            model: "Unknown".to_string(),
        }
    }

    fn kill_stale_processes(&self, signal: Option<&str>) {
        if !self.kill_stale {
            return;
        }
        let mut args: Vec<&str> = Vec::new();
        if let Some(sig) = signal {
            args.push(sig);
        }
        args.push("gphoto2");
        let _ = run_with_timeout("killall", &args, Duration::from_secs(1));
        thread::sleep(Duration::from_millis(300)); // let USB settle after the kill
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<Output> {
        log::debug!(target: "camera", "{} {}", self.binary, args.join(" "));
        run_with_timeout(&self.binary, args, timeout)
    }

    fn failure(&self, what: &str, output: &Output) -> anyhow::Error {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let msg = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output").trim().to_string();
        anyhow!("{} failed ({}): {}", what, output.status, msg)
    }
}

impl CaptureDevice for Gphoto2Camera {
    fn detect(&mut self, force: bool) -> bool {
        if !force {
            if let Some(last) = self.last_check {
                if last.elapsed() < self.check_interval {
                    return self.connected;
                }
            }
        }
        self.last_check = Some(Instant::now());
        self.kill_stale_processes(None);

        match self.run(&["--auto-detect"], DETECT_TIMEOUT) {
            Ok(out) if out.status.success() => {
                match parse_auto_detect(&String::from_utf8_lossy(&out.stdout)) {
                    Some(model) => {
                        if !self.connected {
                            log::info!(target: "camera", "Camera detected: {}", model);
                        }
                        self.connected = true;
                        self.model = model;
                    }
                    None => {
                        self.connected = false;
                        self.model = "Not detected".to_string();
                    }
                }
            }
            Ok(out) => {
                log::warn!(target: "camera", "{:#}", self.failure("auto-detect", &out));
                self.connected = false;
                self.model = "Check failed".to_string();
            }
            Err(e) => {
                log::warn!(target: "camera", "Camera check failed: {:#}", e);
                self.connected = false;
                self.model = "Check failed".to_string();
            }
        }
        self.connected
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn capture(&mut self) -> Result<CaptureOutcome> {
        self.kill_stale_processes(None);
        if let Err(e) = self.autofocus_inner() {
            // Manual-focus lenses reject autofocus; capture anyway
            log::debug!(target: "camera", "Autofocus before capture failed: {:#}", e);
        }

        let out = match self.run(&["--capture-image"], self.capture_timeout) {
            Ok(out) => out,
            Err(e) => {
                self.kill_stale_processes(Some("-9"));
                return Err(e);
            }
        };
        if !out.status.success() {
            self.kill_stale_processes(Some("-9"));
            return Err(self.failure("capture", &out));
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let detail = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim().to_string();
        log::info!(target: "camera", "Captured: {}", detail);
        Ok(CaptureOutcome { detail })
    }

    fn autofocus(&mut self) -> Result<()> {
        self.kill_stale_processes(None);
        self.autofocus_inner()
    }

    fn preview(&mut self) -> Result<Vec<u8>> {
        self.kill_stale_processes(None);
        let out = self.run(&["--capture-preview", "--stdout"], self.preview_timeout)?;
        if !out.status.success() {
            return Err(self.failure("preview", &out));
        }
        extract_jpeg(&out.stdout)
            .map(|jpeg| jpeg.to_vec())
            .ok_or_else(|| anyhow!("Preview returned no JPEG data ({} bytes)", out.stdout.len()))
    }
}

impl Gphoto2Camera {
    fn autofocus_inner(&self) -> Result<()> {
        let out = self.run(&["--set-config", "autofocus=1"], CONFIG_TIMEOUT)?;
        if !out.status.success() {
            return Err(self.failure("autofocus", &out));
        }
        thread::sleep(FOCUS_SETTLE);
        Ok(())
    }
}
