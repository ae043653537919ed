/// Status snapshots and their fan-out to connected clients.
///
/// Every committed change produces a [`StatusSnapshot`] that is pushed through a
/// `tokio::sync::broadcast` channel; each WebSocket connection holds its own
/// receiver. There is no per-client state: all observers see the same snapshot.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::scanner_state::ScannerState;

/// Snapshots buffered per receiver before a slow client starts skipping.
const BROADCAST_CAPACITY: usize = 64;

/// Where the calibration workflow currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    #[default]
    Idle,
    AwaitingFrame1,
    AwaitingFrame2,
}

/// Full state pushed to clients as `status_update`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub state: ScannerState,
    pub calibration: CalibrationPhase,
    pub frame1_pos: Option<i64>,
    pub strip_pending: bool,
    pub fine_step: i64,
    pub coarse_step: i64,
    pub arduino_connected: bool,
    pub arduino_port: Option<String>,
    pub camera_connected: bool,
    pub camera_model: String,
    pub status_msg: String,
}

/// Messages a client may send over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    RequestStatus,
}

/// Messages the server pushes over the WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    StatusUpdate(StatusSnapshot),
}

/// Observer list for status snapshots.
#[derive(Debug, Clone)]
pub struct StatusHub {
    tx: broadcast::Sender<StatusSnapshot>,
}

impl StatusHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Push `snapshot` to every subscriber. Having none is not an error.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        let _ = self.tx.send(snapshot);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
