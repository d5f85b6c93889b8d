//! Channel layout of a connected Axon and the board descriptor published
//! to the metadata catalog.
//!
//! The Axon is modular: every EEG module plugged into the base unit adds
//! eight channels. The device reports its modules once per session (a BLE
//! announcement or the serial init packet) and the resulting
//! [`ChannelLayout`] then drives both frame decoding and the row layout of
//! every sample record:
//!
//! ```text
//! row:  0 .. 8k-1 | 8k     | 8k+1    | 8k+2      | 8k+3
//!       EEG       | status | battery | timestamp | marker
//! ```

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;

use serde::Serialize;

/// EEG channels contributed by one module.
pub const CHANNELS_PER_MODULE: usize = 8;

/// Rows appended after the EEG block: status, battery, timestamp, marker.
pub const TRAILING_ROWS: usize = 4;

/// Bytes per EEG sample on the wire (24-bit big-endian).
pub const EEG_SAMPLE_BYTES: usize = 3;

/// Start marker plus packet number.
pub const FRAME_HEADER_LEN: usize = 2;

/// Status word, battery byte and stop marker.
pub const FRAME_TRAILER_LEN: usize = 4;

/// Catalog identifiers of the two Axon transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardId {
    AxonBle = 56,
    AxonSerial = 57,
}

impl BoardId {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Where each value sits in a decoded sample record.
///
/// Computed once from the device's module report and immutable afterwards;
/// a later report replaces the whole value rather than patching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelLayout {
    pub channel_count: usize,
    pub status_channel_index: usize,
    pub battery_channel_index: usize,
    pub timestamp_channel_index: Option<usize>,
    pub marker_channel_index: Option<usize>,
    pub total_row_count: usize,
}

impl ChannelLayout {
    /// Layout for `modules` EEG modules.
    pub fn from_module_count(modules: usize) -> Self {
        let channel_count = modules * CHANNELS_PER_MODULE;
        let total_row_count = channel_count + TRAILING_ROWS;
        Self {
            channel_count,
            status_channel_index: total_row_count - 4,
            battery_channel_index: total_row_count - 3,
            timestamp_channel_index: Some(total_row_count - 2),
            marker_channel_index: Some(total_row_count - 1),
            total_row_count,
        }
    }

    /// Layout from a BLE module announcement: one module per `marker` byte.
    pub fn from_ble_announcement(payload: &[u8], marker: u8) -> Self {
        Self::from_module_count(payload.iter().filter(|&&b| b == marker).count())
    }

    /// Layout from a serial init packet: one module per `marker` character.
    pub fn from_init_packet(packet: &[u8], marker: u8) -> Self {
        Self::from_module_count(packet.iter().filter(|&&b| b == marker).count())
    }

    pub fn module_count(&self) -> usize {
        self.channel_count / CHANNELS_PER_MODULE
    }

    /// Record rows holding EEG samples.
    pub fn eeg_rows(&self) -> Range<usize> {
        0..self.channel_count
    }

    /// Size in bytes of one data frame on the wire.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.channel_count * EEG_SAMPLE_BYTES + FRAME_TRAILER_LEN
    }

    pub fn descriptor(&self) -> BoardDescriptor {
        BoardDescriptor {
            eeg_channels: self.eeg_rows().collect(),
            eeg_names: Vec::new(),
            num_rows: self.total_row_count,
            status_channel: self.status_channel_index,
            battery_channel: self.battery_channel_index,
            timestamp_channel: self.timestamp_channel_index,
            marker_channel: self.marker_channel_index,
        }
    }
}

/// Catalog record describing the rows of this board's sample records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardDescriptor {
    pub eeg_channels: Vec<usize>,
    pub eeg_names: Vec<String>,
    pub num_rows: usize,
    pub status_channel: usize,
    pub battery_channel: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_channel: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker_channel: Option<usize>,
}

impl BoardDescriptor {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Receiver of board descriptors, owned outside the driver.
///
/// The driver only writes; it never reads a descriptor back for decoding.
pub trait BoardCatalog: Send + Sync {
    fn publish(&self, board: BoardId, descriptor: BoardDescriptor);
}

/// Thread-safe in-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Mutex<HashMap<BoardId, BoardDescriptor>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, board: BoardId) -> Option<BoardDescriptor> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&board).cloned())
    }
}

impl BoardCatalog for MemoryCatalog {
    fn publish(&self, board: BoardId, descriptor: BoardDescriptor) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(board, descriptor);
        }
    }
}
