//! Continuous read paths.
//!
//! BLE delivers one frame per notification on a thread owned by the BLE
//! stack, so [`NotificationHandler`] decodes in place and never blocks.
//! Serial delivers a byte stream, so [`SerialReader`] owns a dedicated
//! thread that resynchronizes on the start marker before every frame.
//!
//! Framing errors are expected on both paths: the frame is dropped, the
//! drop is counted in [`StreamStats`], and the loop carries on.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::frame::{
    decode_frame, FrameError, MonotonicClock, BLE_ANNOUNCEMENT_LEN, BLE_MODULE_MARKER,
    BLE_STOP_BYTE, SERIAL_STOP_BYTE, START_BYTE,
};
use crate::layout::{BoardCatalog, BoardId, ChannelLayout};
use crate::serial::SerialLink;

/// Pause after a hard read error so a vanished port does not spin the reader.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Downstream consumer of decoded sample records, one record per call.
pub trait SampleSink: Send + Sync {
    fn push(&self, record: &[f64]);
}

impl<F> SampleSink for F
where
    F: Fn(&[f64]) + Send + Sync,
{
    fn push(&self, record: &[f64]) {
        self(record)
    }
}

/// Per-session frame counters.
#[derive(Debug, Default)]
pub struct StreamStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    resync_bytes: AtomicU64,
}

impl StreamStats {
    /// Frames decoded and handed to the sink.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Frames rejected for bad markers or length.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Bytes skipped while hunting for a start marker (serial only).
    pub fn resync_bytes(&self) -> u64 {
        self.resync_bytes.load(Ordering::Relaxed)
    }

    fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_resync(&self) {
        self.resync_bytes.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// BLE
// ============================================================================

/// Decodes BLE notification payloads as they arrive.
///
/// A 10-byte payload is a module announcement and replaces the current
/// layout; anything else is a data frame.
pub struct NotificationHandler {
    layout: RwLock<Option<ChannelLayout>>,
    sink: Arc<dyn SampleSink>,
    catalog: Option<Arc<dyn BoardCatalog>>,
    clock: MonotonicClock,
    stats: Arc<StreamStats>,
}

impl NotificationHandler {
    pub fn new(
        initial_layout: Option<ChannelLayout>,
        sink: Arc<dyn SampleSink>,
        catalog: Option<Arc<dyn BoardCatalog>>,
    ) -> Self {
        Self {
            layout: RwLock::new(initial_layout),
            sink,
            catalog,
            clock: MonotonicClock::new(),
            stats: Arc::new(StreamStats::default()),
        }
    }

    pub fn layout(&self) -> Option<ChannelLayout> {
        self.layout.read().ok().and_then(|layout| *layout)
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    pub fn handle(&self, payload: &[u8]) {
        if payload.len() == BLE_ANNOUNCEMENT_LEN {
            self.apply_announcement(payload);
            return;
        }

        match self.decode(payload) {
            Ok(record) => {
                self.stats.record_accepted();
                self.sink.push(&record);
            }
            Err(e) => {
                self.stats.record_dropped();
                trace!("dropping BLE frame: len={}, reason={}", payload.len(), e);
            }
        }
    }

    fn apply_announcement(&self, payload: &[u8]) {
        let layout = ChannelLayout::from_ble_announcement(payload, BLE_MODULE_MARKER);
        info!(
            "module announcement: modules={}, eeg_channels={}, rows={}",
            layout.module_count(),
            layout.channel_count,
            layout.total_row_count
        );
        if let Ok(mut current) = self.layout.write() {
            *current = Some(layout);
        }
        if let Some(catalog) = &self.catalog {
            catalog.publish(BoardId::AxonBle, layout.descriptor());
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<f64>, FrameError> {
        let layout = self.layout().ok_or(FrameError::NoLayout)?;
        decode_frame(payload, &layout, BLE_STOP_BYTE, self.clock.now())
    }
}

// ============================================================================
// Serial
// ============================================================================

/// Blocking frame reader for the serial link.
///
/// Runs until `keep_alive` is cleared; the owner joins the thread before
/// touching the port again.
pub struct SerialReader {
    port: Box<dyn SerialLink>,
    layout: ChannelLayout,
    sink: Arc<dyn SampleSink>,
    keep_alive: Arc<AtomicBool>,
    clock: MonotonicClock,
    stats: Arc<StreamStats>,
}

impl SerialReader {
    pub fn new(
        port: Box<dyn SerialLink>,
        layout: ChannelLayout,
        sink: Arc<dyn SampleSink>,
        keep_alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            port,
            layout,
            sink,
            keep_alive,
            clock: MonotonicClock::new(),
            stats: Arc::new(StreamStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("axon-serial-reader".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        let frame_len = self.layout.frame_len();
        let mut frame = vec![0u8; frame_len];
        debug!(
            "serial reader started: frame_len={}, rows={}",
            frame_len, self.layout.total_row_count
        );

        // bytes already in `frame`, carried over after a failed candidate
        let mut filled = 0;
        while self.keep_alive.load(Ordering::Acquire) {
            if filled == 0 {
                match self.read_byte() {
                    Some(START_BYTE) => {}
                    Some(other) => {
                        self.stats.record_resync();
                        trace!("skipping byte {:#04X} while waiting for start byte", other);
                        continue;
                    }
                    None => continue,
                }
                frame[0] = START_BYTE;
                filled = 1;
            }

            if !self.fill(&mut frame[filled..]) {
                break;
            }
            filled = 0;

            match decode_frame(&frame, &self.layout, SERIAL_STOP_BYTE, self.clock.now()) {
                Ok(record) => {
                    self.stats.record_accepted();
                    self.sink.push(&record);
                }
                Err(e) => {
                    self.stats.record_dropped();
                    warn!("dropping serial frame: {}", e);
                    if let FrameError::BadStop(_) = e {
                        filled = realign(&mut frame);
                    }
                }
            }
        }

        debug!(
            "serial reader stopped: accepted={}, dropped={}, resync_bytes={}",
            self.stats.accepted(),
            self.stats.dropped(),
            self.stats.resync_bytes()
        );
    }

    /// One byte, or `None` on timeout or error.
    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            Ok(_) => {
                thread::sleep(READ_ERROR_BACKOFF);
                None
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => None,
            Err(e) if e.kind() == ErrorKind::Interrupted => None,
            Err(e) => {
                warn!("serial read failed: {}", e);
                thread::sleep(READ_ERROR_BACKOFF);
                None
            }
        }
    }

    /// Fill `buf` across partial reads. Returns `false` if stopped mid-frame.
    fn fill(&mut self, buf: &mut [u8]) -> bool {
        let mut pos = 0;
        while pos < buf.len() {
            if !self.keep_alive.load(Ordering::Acquire) {
                return false;
            }
            match self.port.read(&mut buf[pos..]) {
                // end of file: the port went away under us
                Ok(0) => thread::sleep(READ_ERROR_BACKOFF),
                Ok(n) => pos += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    warn!("serial read failed mid-frame: {}", e);
                    thread::sleep(READ_ERROR_BACKOFF);
                }
            }
        }
        true
    }
}

/// Move the next start byte after position 0 to the front of `frame`.
///
/// Returns how many bytes were kept, or 0 when `frame` holds no other start
/// byte and scanning has to begin afresh.
fn realign(frame: &mut [u8]) -> usize {
    match frame.iter().skip(1).position(|&b| b == START_BYTE) {
        Some(offset) => {
            let from = offset + 1;
            frame.copy_within(from.., 0);
            frame.len() - from
        }
        None => 0,
    }
}
