/// Scanner state record and its JSON persistence.
///
/// One file per roll at `<scan_root>/<YYYY-MM-DD>/<roll_name>/.scan_state.json`,
/// rewritten after every mutation. At startup the most recently written file is
/// reloaded. Between rolls the position and operator toggles go to
/// `<scan_root>/.scanner_idle.json`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const STATE_FILE_NAME: &str = ".scan_state.json";
/// State kept directly under the scan root while no roll is open.
pub const IDLE_FILE_NAME: &str = ".scanner_idle.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Manual,
    Calibrated,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Manual => "manual",
            Mode::Calibrated => "calibrated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerState {
    pub roll_name: Option<String>,
    pub strip_count: u32,
    pub frame_count: u32,
    pub frames_in_strip: u32,
    pub position: i64,
    pub frame_advance: Option<i64>,
    pub mode: Mode,
    pub auto_advance: bool,
    #[serde(default)]
    pub is_large_step: bool,
    /// Transport position of every counted frame, in capture order.
    #[serde(default)]
    pub frame_positions: Vec<i64>,
    #[serde(default)]
    pub roll_folder: Option<PathBuf>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

impl Default for ScannerState {
    fn default() -> Self {
        Self {
            roll_name: None,
            strip_count: 0,
            frame_count: 0,
            frames_in_strip: 0,
            position: 0,
            frame_advance: None,
            mode: Mode::Manual,
            auto_advance: true,
            is_large_step: false,
            frame_positions: Vec::new(),
            roll_folder: None,
            closed: false,
            updated: None,
        }
    }
}

impl ScannerState {
    pub fn has_roll(&self) -> bool {
        self.roll_name.is_some()
    }

    /// Start a fresh roll: counters, calibration and mode are cleared.
    pub fn begin_roll(&mut self, roll_name: &str, roll_folder: PathBuf) {
        self.roll_name = Some(roll_name.to_string());
        self.roll_folder = Some(roll_folder);
        self.frame_count = 0;
        self.strip_count = 0;
        self.frames_in_strip = 0;
        self.frame_advance = None;
        self.mode = Mode::Manual;
        self.frame_positions.clear();
        self.closed = false;
    }

    /// State carried over once a roll is closed: only physical/operator settings.
    pub fn after_close(&self) -> ScannerState {
        ScannerState {
            position: self.position,
            auto_advance: self.auto_advance,
            is_large_step: self.is_large_step,
            ..ScannerState::default()
        }
    }
}

/// Check a roll name is usable as a single directory component.
pub fn validate_roll_name(name: &str) -> std::result::Result<&str, &'static str> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Roll name required");
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err("Roll name must not contain path separators");
    }
    Ok(name)
}

/// Reads and writes per-roll state files under a scan root
#[derive(Debug, Clone)]
pub struct StateStore {
    scan_root: PathBuf,
}

impl StateStore {
    pub fn new(scan_root: impl Into<PathBuf>) -> Self {
        Self { scan_root: scan_root.into() }
    }

    pub fn scan_root(&self) -> &Path {
        &self.scan_root
    }

    pub fn roll_folder(&self, date: NaiveDate, roll_name: &str) -> PathBuf {
        self.scan_root.join(date.format("%Y-%m-%d").to_string()).join(roll_name)
    }

    pub fn state_path(roll_folder: &Path) -> PathBuf {
        roll_folder.join(STATE_FILE_NAME)
    }

    /// Write `state` into its roll folder. States without a roll folder are not persisted.
    pub fn save(&self, state: &ScannerState) -> Result<()> {
        let Some(folder) = state.roll_folder.as_ref() else {
            return Ok(());
        };
        write_atomic(folder, &Self::state_path(folder), state)
    }

    pub fn idle_path(&self) -> PathBuf {
        self.scan_root.join(IDLE_FILE_NAME)
    }

    /// Write a state that belongs to no roll.
    pub fn save_idle(&self, state: &ScannerState) -> Result<()> {
        write_atomic(&self.scan_root, &self.idle_path(), state)
    }

    pub fn load_idle(&self) -> Result<Option<ScannerState>> {
        let path = self.idle_path();
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    pub fn load(path: &Path) -> Result<ScannerState> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&text).map_err(|e| anyhow!("Corrupt state file {:?}: {}", path, e))
    }

    /// Most recently modified state file two levels below the scan root.
    pub fn latest_state_file(&self) -> Option<PathBuf> {
        let mut best: Option<(SystemTime, PathBuf)> = None;
        let dates = fs::read_dir(&self.scan_root).ok()?;
        for date_dir in dates.flatten().filter(|e| e.path().is_dir()) {
            let Ok(rolls) = fs::read_dir(date_dir.path()) else { continue };
            for roll_dir in rolls.flatten() {
                let candidate = Self::state_path(&roll_dir.path());
                let Ok(modified) = fs::metadata(&candidate).and_then(|m| m.modified()) else { continue };
                if best.as_ref().map_or(true, |(t, _)| modified > *t) {
                    best = Some((modified, candidate));
                }
            }
        }
        best.map(|(_, path)| path)
    }

    pub fn load_latest(&self) -> Result<Option<ScannerState>> {
        match self.latest_state_file() {
            Some(path) => Self::load(&path).map(Some),
            None => Ok(None),
        }
    }
}

/// Write `state` to `path` through a temporary file in `folder`.
fn write_atomic(folder: &Path, path: &Path, state: &ScannerState) -> Result<()> {
    fs::create_dir_all(folder).with_context(|| format!("Failed to create {:?}", folder))?;
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(state)?;
    fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    log::debug!(target: "scanner_state", "Saved state to {:?}", path);
    Ok(())
}
