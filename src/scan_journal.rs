/// Scan journal for the film scanner
///
/// Appends one JSON line per workflow event (capture, calibration, strip, roll)
/// to `scan_log.jsonl` inside the roll folder.
///
/// Event-driven, non-blocking: callers hand events to a bounded channel and a
/// dedicated writer thread does the file I/O. A full channel drops the event.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

pub const JOURNAL_FILE_NAME: &str = "scan_log.jsonl";
const CHANNEL_CAPACITY: usize = 100;

enum JournalCommand {
    Append { path: PathBuf, event: ScanEvent },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub recorded_at: DateTime<Utc>,
    pub roll_name: String,
    pub event_type: String, // "capture", "calibration", "strip", "roll"
    pub status: String,     // "completed", "failed", "started", "cancelled"
    pub message: String,
    pub position: i64,
    pub frame_count: u32,
    pub strip_count: u32,
}

fn append_event(path: &Path, event: &ScanEvent) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    file.write_all(&line).context("Failed to append scan event")?;
    Ok(())
}

pub struct ScanJournal {
    write_tx: Option<SyncSender<JournalCommand>>,
    writer: Option<JoinHandle<()>>,
}

impl ScanJournal {
    pub fn new() -> Self {
        let (write_tx, write_rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let writer = thread::Builder::new()
            .name("scan-journal".to_string())
            .spawn(move || Self::writer_thread(write_rx));
        match writer {
            Ok(handle) => Self { write_tx: Some(write_tx), writer: Some(handle) },
            Err(e) => {
                error!(target: "scan_journal", "Could not start journal writer: {} - journal disabled", e);
                Self::disabled()
            }
        }
    }

    /// Journal that drops every event.
    pub fn disabled() -> Self {
        Self { write_tx: None, writer: None }
    }

    // Dedicated writer thread - processes commands until every sender is gone
    fn writer_thread(write_rx: Receiver<JournalCommand>) {
        debug!(target: "scan_journal", "Journal writer started");
        let mut written = 0u64;
        let mut errors = 0u64;
        while let Ok(JournalCommand::Append { path, event }) = write_rx.recv() {
            match append_event(&path, &event) {
                Ok(()) => written += 1,
                Err(e) => {
                    errors += 1;
                    error!(target: "scan_journal", "Failed to journal {} event: {:#}", event.event_type, e);
                }
            }
        }
        info!(target: "scan_journal", "Journal writer stopped. Written: {}, Errors: {}", written, errors);
    }

    /// Queue `event` for `roll_folder`. Never blocks.
    pub fn record(&self, roll_folder: &Path, event: ScanEvent) {
        let Some(tx) = self.write_tx.as_ref() else { return };
        let path = roll_folder.join(JOURNAL_FILE_NAME);
        match tx.try_send(JournalCommand::Append { path, event }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(target: "scan_journal", "Journal buffer full (falling behind) - dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(target: "scan_journal", "Writer thread disconnected");
            }
        }
    }
}

impl Default for ScanJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScanJournal {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain what is queued and exit
        self.write_tx.take();
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

/// Read every event from a journal file.
pub fn read_journal(roll_folder: &Path) -> Result<Vec<ScanEvent>> {
    let text = std::fs::read_to_string(roll_folder.join(JOURNAL_FILE_NAME))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("Malformed journal line"))
        .collect()
}
