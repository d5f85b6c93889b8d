//! Frame decoding shared by the BLE and serial transports.
//!
//! Data frame (both transports, `n` EEG channels):
//!
//! ```text
//! | 0x0A | pkt | EEG 0 (3B) | ... | EEG n-1 (3B) | status (2B) | battery | stop |
//! ```
//!
//! EEG samples are signed 24-bit big-endian, status is an unsigned 16-bit
//! big-endian word. The stop marker differs per transport: `0x0D` on BLE,
//! `0x0B` on serial. The device carries no timestamp; the host stamps each
//! record at decode time.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::layout::{ChannelLayout, EEG_SAMPLE_BYTES, FRAME_HEADER_LEN};

pub const START_BYTE: u8 = 0x0A;
pub const BLE_STOP_BYTE: u8 = 0x0D;
pub const SERIAL_STOP_BYTE: u8 = 0x0B;

/// BLE notifications of this size announce the module layout.
pub const BLE_ANNOUNCEMENT_LEN: usize = 10;
/// Module id inside a BLE announcement.
pub const BLE_MODULE_MARKER: u8 = 0x02;
/// Module id character inside the serial init packet.
pub const SERIAL_MODULE_MARKER: u8 = b'2';

/// Why a frame was rejected. Always recoverable: the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid start byte {0:#04X}")]
    BadStart(u8),
    #[error("invalid stop byte {0:#04X}")]
    BadStop(u8),
    #[error("frame length {actual} does not match layout ({expected} bytes)")]
    Length { expected: usize, actual: usize },
    #[error("no channel layout known yet")]
    NoLayout,
}

/// Signed 24-bit big-endian integer.
#[inline]
pub fn be24(bytes: &[u8]) -> i32 {
    let raw = (i32::from(bytes[0]) << 16) | (i32::from(bytes[1]) << 8) | i32::from(bytes[2]);
    (raw << 8) >> 8
}

/// Unsigned 16-bit big-endian integer.
#[inline]
pub fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Check the framing bytes of `frame` against `layout`.
pub fn validate_frame(
    frame: &[u8],
    layout: &ChannelLayout,
    stop_byte: u8,
) -> Result<(), FrameError> {
    let expected = layout.frame_len();
    if frame.len() != expected {
        return Err(FrameError::Length {
            expected,
            actual: frame.len(),
        });
    }
    if frame[0] != START_BYTE {
        return Err(FrameError::BadStart(frame[0]));
    }
    let last = frame[frame.len() - 1];
    if last != stop_byte {
        return Err(FrameError::BadStop(last));
    }
    Ok(())
}

/// Decode one validated data frame into a sample record of
/// `layout.total_row_count` values.
pub fn decode_frame(
    frame: &[u8],
    layout: &ChannelLayout,
    stop_byte: u8,
    timestamp: f64,
) -> Result<Vec<f64>, FrameError> {
    validate_frame(frame, layout, stop_byte)?;

    let mut record = vec![0.0; layout.total_row_count];
    let eeg = &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + layout.channel_count * EEG_SAMPLE_BYTES];
    for (row, sample) in layout.eeg_rows().zip(eeg.chunks_exact(EEG_SAMPLE_BYTES)) {
        record[row] = f64::from(be24(sample));
    }

    let len = frame.len();
    record[layout.status_channel_index] = f64::from(be16(&frame[len - 4..len - 2]));
    record[layout.battery_channel_index] = f64::from(frame[len - 2]);
    if let Some(row) = layout.timestamp_channel_index {
        record[row] = timestamp;
    }
    Ok(record)
}

/// Host clock for the timestamp row.
///
/// Anchored to wall-clock time once, then advanced with [`Instant`] so
/// timestamps within a session never step backwards.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
    origin_unix: f64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let origin_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            origin: Instant::now(),
            origin_unix,
        }
    }

    /// Seconds since the Unix epoch.
    pub fn now(&self) -> f64 {
        self.origin_unix + self.origin.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
