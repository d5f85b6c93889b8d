//! Serial (UART) transport for the Axon base unit.
//!
//! The handshake is plain ASCII: `c` resets the board, `p` asks for the
//! init packet, `b` begins streaming and `h` halts it. The init packet lists
//! the plugged modules; every `'2'` in it is one 8-channel EEG module.
//!
//! ```text
//! Idle -> Opening -> Configuring -> AwaitingInitPacket -> Ready -> Streaming
//!            \____________\_________________\__________-> Failed
//! ```

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::errors::{DriverError, Result};
use crate::frame::{SERIAL_MODULE_MARKER, START_BYTE};
use crate::layout::ChannelLayout;
use crate::stream::{SampleSink, SerialReader, StreamStats};

/// Default serial baud rate for the Axon base unit
const BAUD_RATE: u32 = 115_200;

/// Read timeout applied to the port; also bounds how long `stop` waits for the reader
const READ_TIMEOUT: Duration = Duration::from_millis(1000);

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// Axon serial commands
pub const CMD_RESET: &str = "c";
pub const CMD_INIT_PACKET: &str = "p";
pub const CMD_BEGIN: &str = "b";
pub const CMD_HALT: &str = "h";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Opening,
    Configuring,
    AwaitingInitPacket,
    Ready,
    Streaming,
    Failed,
    Released,
}

/// Timing of the serial handshake and streaming commands.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub read_timeout: Duration,
    /// Wait after the reset command before asking for the init packet.
    pub reset_delay: Duration,
    /// Wait after the first init-packet request before reading.
    pub init_delay: Duration,
    /// Re-send the init-packet request this often while nothing arrives.
    pub init_resend_interval: Duration,
    /// Gap between the two begin-stream commands.
    pub begin_repeat_delay: Duration,
    /// Sleep between empty polls during the handshake.
    pub poll_interval: Duration,
    /// Upper bound on a single command response.
    pub max_response_len: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            read_timeout: READ_TIMEOUT,
            reset_delay: Duration::from_millis(1500),
            init_delay: Duration::from_millis(2000),
            init_resend_interval: Duration::from_secs(3),
            begin_repeat_delay: Duration::from_millis(1200),
            poll_interval: Duration::from_millis(10),
            max_response_len: 4096,
        }
    }
}

// ============================================================================
// Port Abstraction
// ============================================================================

/// Byte-level serial link. Implemented for real `serialport` handles and
/// for in-memory fakes in tests.
pub trait SerialLink: Read + Write + Send {
    /// Apply baud rate and read timeout.
    fn apply_settings(&mut self, baud_rate: u32, timeout: Duration) -> Result<()>;
    /// Second handle to the same port, used by the reader thread.
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>>;
    /// Discard unread input.
    fn clear_input(&mut self) -> Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn apply_settings(&mut self, baud_rate: u32, timeout: Duration) -> Result<()> {
        self.set_baud_rate(baud_rate)?;
        self.set_timeout(timeout)?;
        Ok(())
    }

    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>> {
        let port = self.try_clone()?;
        Ok(Box::new(port))
    }

    fn clear_input(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Opens serial links by name.
pub trait PortOpener: Send {
    fn open(&self, port_name: &str) -> Result<Box<dyn SerialLink>>;
}

/// Opens OS serial ports through `serialport`.
#[derive(Debug, Clone, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, port_name: &str) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(port_name, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| classify_open_error(port_name, &e))?;
        Ok(Box::new(port))
    }
}

/// Map an open failure onto the driver's error kinds.
fn classify_open_error(port_name: &str, e: &serialport::Error) -> DriverError {
    use serialport::ErrorKind as Kind;

    let busy = match e.kind() {
        Kind::NoDevice | Kind::InvalidInput => false,
        Kind::Io(ErrorKind::NotFound | ErrorKind::PermissionDenied) => false,
        // EBUSY from an exclusive open has no kind of its own
        _ => e.description.to_lowercase().contains("busy"),
    };
    if busy {
        DriverError::PortAlreadyOpen(port_name.to_string())
    } else {
        DriverError::UnableToOpen {
            port: port_name.to_string(),
            reason: e.to_string(),
        }
    }
}

// ============================================================================
// Handshake Manager
// ============================================================================

struct ReaderHandle {
    keep_alive: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Owns the serial port from open through release.
pub struct SerialHandshakeManager<O: PortOpener = SystemPorts> {
    opener: O,
    config: SerialConfig,
    port: Option<Box<dyn SerialLink>>,
    port_name: String,
    state: HandshakeState,
    layout: Option<ChannelLayout>,
    reader: Option<ReaderHandle>,
    stats: Option<Arc<StreamStats>>,
}

impl SerialHandshakeManager<SystemPorts> {
    pub fn system(config: SerialConfig) -> Self {
        Self::new(SystemPorts, config)
    }
}

impl<O: PortOpener> SerialHandshakeManager<O> {
    pub fn new(opener: O, config: SerialConfig) -> Self {
        Self {
            opener,
            config,
            port: None,
            port_name: String::new(),
            state: HandshakeState::Idle,
            layout: None,
            reader: None,
            stats: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn layout(&self) -> Option<ChannelLayout> {
        self.layout
    }

    /// Counters of the running (or last) reader thread.
    pub fn stats(&self) -> Option<Arc<StreamStats>> {
        self.stats.clone()
    }

    /// Open `port_name`, reset the board and derive the channel layout from
    /// its init packet.
    pub fn prepare(&mut self, port_name: &str, timeout_secs: u64) -> Result<ChannelLayout> {
        if let (HandshakeState::Ready | HandshakeState::Streaming, Some(layout)) =
            (self.state, self.layout)
        {
            info!("session already prepared: port={}", self.port_name);
            return Ok(layout);
        }
        if port_name.is_empty() {
            return Err(DriverError::InvalidArgument("serial port is empty".into()));
        }

        self.state = HandshakeState::Opening;
        if self.port.is_some() {
            error!("port already open: port={}", self.port_name);
            return Err(DriverError::PortAlreadyOpen(self.port_name.clone()));
        }

        info!("opening port {}", port_name);
        let mut port = match self.opener.open(port_name) {
            Ok(port) => port,
            Err(e) => {
                error!(
                    "unable to open {}: {}. Check the port name and permissions, and close other apps using it.",
                    port_name, e
                );
                self.state = HandshakeState::Failed;
                return Err(match e {
                    e @ (DriverError::UnableToOpen { .. } | DriverError::PortAlreadyOpen(_)) => e,
                    other => DriverError::UnableToOpen {
                        port: port_name.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        self.state = HandshakeState::Configuring;
        if let Err(e) = port.apply_settings(self.config.baud_rate, self.config.read_timeout) {
            error!("unable to set port settings: {}", e);
            if let Err(e) = write_command(&mut *port, CMD_RESET) {
                debug!("reset after settings failure not sent: {}", e);
            }
            self.state = HandshakeState::Failed;
            return Err(DriverError::SetPortError(e.to_string()));
        }
        trace!("port settings applied: baud={}", self.config.baud_rate);

        self.port = Some(port);
        self.port_name = port_name.to_string();
        self.state = HandshakeState::AwaitingInitPacket;

        match self.await_init_packet(Duration::from_secs(timeout_secs)) {
            Ok(layout) => {
                info!(
                    "board initialized: port={}, modules={}, eeg_channels={}",
                    self.port_name,
                    layout.module_count(),
                    layout.channel_count
                );
                self.layout = Some(layout);
                self.state = HandshakeState::Ready;
                Ok(layout)
            }
            Err(e) => {
                self.abort_handshake();
                Err(e)
            }
        }
    }

    fn await_init_packet(&mut self, timeout: Duration) -> Result<ChannelLayout> {
        if let Err(e) = self.write_raw(CMD_RESET) {
            warn!("failed to send reset command: {}", e);
        }
        thread::sleep(self.config.reset_delay);
        if let Err(e) = self.write_raw(CMD_INIT_PACKET) {
            error!("failed to send initialization command: {}", e);
        }
        thread::sleep(self.config.init_delay);

        let mut response = self.read_response();
        let start = Instant::now();
        let mut last_prompt = start;
        let mut last_report = 0u64;
        while response.is_empty() && start.elapsed() < timeout {
            if last_prompt.elapsed() >= self.config.init_resend_interval {
                if let Err(e) = self.write_raw(CMD_INIT_PACKET) {
                    error!("failed to send initialization command: {}", e);
                }
                last_prompt = Instant::now();
            }
            response.extend(self.read_response());

            let waited = start.elapsed().as_secs();
            if waited > last_report {
                last_report = waited;
                debug!("waiting for initialization packet: waited={}s", waited);
            }
            if response.is_empty() {
                thread::sleep(self.config.poll_interval);
            }
        }

        if response.is_empty() {
            error!("empty initialization packet");
            return Err(DriverError::BoardNotReady(format!(
                "no initialization packet within {timeout:?}"
            )));
        }
        debug!(
            "initialization packet: {:?}",
            String::from_utf8_lossy(&response)
        );
        parse_init_packet(&response)
    }

    /// Best-effort cleanup after a failed handshake.
    fn abort_handshake(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = write_command(&mut *port, CMD_RESET) {
                debug!("reset after failed handshake not sent: {}", e);
            }
        }
        self.layout = None;
        self.state = HandshakeState::Failed;
    }

    /// Drain pending bytes into a bounded buffer until the port goes quiet.
    pub fn read_response(&mut self) -> Vec<u8> {
        let max_len = self.config.max_response_len;
        let Some(port) = self.port.as_mut() else {
            return Vec::new();
        };

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(1) => {
                    if response.len() < max_len {
                        response.push(byte[0]);
                    } else {
                        warn!("response exceeds {} bytes, flushing input", max_len);
                        if let Err(e) = port.clear_input() {
                            warn!("failed to flush input: {}", e);
                        }
                        break;
                    }
                }
                Ok(_) => break,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
                Err(e) => {
                    warn!("serial read failed: {}", e);
                    break;
                }
            }
        }
        response
    }

    /// Write a raw command. Without streaming and with `want_response`, the
    /// reply is collected and returned; otherwise the result is empty.
    pub fn send_command(&mut self, command: &str, want_response: bool) -> Result<String> {
        match self.state {
            HandshakeState::Ready => {
                self.write_raw(command)?;
                if !want_response {
                    return Ok(String::new());
                }
                let response = self.read_response();
                Ok(String::from_utf8_lossy(&response).into_owned())
            }
            HandshakeState::Streaming => {
                warn!(
                    "changing board params during streaming may desynchronize the reader thread"
                );
                self.write_raw(command)?;
                Ok(String::new())
            }
            state => Err(DriverError::NotReady(format!(
                "cannot send command in state {state:?}"
            ))),
        }
    }

    /// Send the begin command twice and spawn the reader thread.
    pub fn start_streaming(&mut self, sink: Arc<dyn SampleSink>) -> Result<()> {
        match self.state {
            HandshakeState::Ready => {}
            HandshakeState::Streaming => {
                error!("streaming thread already running");
                return Err(DriverError::StreamAlreadyRunning);
            }
            state => {
                return Err(DriverError::NotReady(format!(
                    "cannot start streaming in state {state:?}"
                )))
            }
        }
        let layout = self
            .layout
            .ok_or_else(|| DriverError::NotReady("channel layout unknown".into()))?;

        self.write_raw(CMD_BEGIN)?;
        thread::sleep(self.config.begin_repeat_delay);
        self.write_raw(CMD_BEGIN)?;

        let reader_port = self
            .port
            .as_ref()
            .ok_or_else(|| DriverError::NotReady("port closed".into()))?
            .try_clone_link()?;
        let keep_alive = Arc::new(AtomicBool::new(true));
        let reader = SerialReader::new(reader_port, layout, sink, Arc::clone(&keep_alive));
        self.stats = Some(reader.stats());
        let thread = reader.spawn()?;

        self.reader = Some(ReaderHandle { keep_alive, thread });
        self.state = HandshakeState::Streaming;
        debug!("streaming started: port={}", self.port_name);
        Ok(())
    }

    /// Stop and join the reader thread, then halt the board.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.state != HandshakeState::Streaming {
            return Err(DriverError::StreamNotRunning);
        }
        if let Some(reader) = self.reader.take() {
            reader.keep_alive.store(false, Ordering::Release);
            if reader.thread.join().is_err() {
                error!("serial reader thread panicked");
            }
        }
        self.state = HandshakeState::Ready;
        self.write_raw(CMD_HALT)
    }

    /// Stop streaming if needed, reset the board and close the port.
    /// Safe to call repeatedly and from any state.
    pub fn release(&mut self) {
        if self.state == HandshakeState::Released {
            return;
        }
        if self.state == HandshakeState::Streaming {
            if let Err(e) = self.stop_streaming() {
                warn!("failed to stop streaming during release: {}", e);
            }
        }
        if self.port.is_some() {
            match self.write_raw(CMD_RESET) {
                Ok(()) => {
                    if self.read_response().is_empty() {
                        debug!("no reset acknowledgment from board");
                    }
                }
                Err(e) => warn!("failed to send reset during release: {}", e),
            }
        }
        self.port = None;
        self.reader = None;
        self.layout = None;
        self.state = HandshakeState::Released;
        debug!("serial session released: port={}", self.port_name);
    }

    fn write_raw(&mut self, command: &str) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("port closed".into()))?;
        write_command(&mut **port, command)
    }
}

impl<O: PortOpener> Drop for SerialHandshakeManager<O> {
    fn drop(&mut self) {
        self.release();
    }
}

fn write_command(port: &mut dyn SerialLink, command: &str) -> Result<()> {
    debug!("sending {:?} to the board", command);
    let bytes = command.as_bytes();
    let written = port
        .write(bytes)
        .map_err(|e| DriverError::WriteFailed(e.to_string()))?;
    if written != bytes.len() {
        return Err(DriverError::WriteFailed(format!(
            "short write: {written} of {} bytes",
            bytes.len()
        )));
    }
    port.flush()
        .map_err(|e| DriverError::WriteFailed(e.to_string()))?;
    Ok(())
}

/// Validate an init packet and derive the channel layout from it.
pub fn parse_init_packet(packet: &[u8]) -> Result<ChannelLayout> {
    if !packet.contains(&START_BYTE) {
        error!("initialization packet improperly formatted");
        trace!("read {:?}", String::from_utf8_lossy(packet));
        return Err(DriverError::MalformedInitPacket(
            "missing start byte".into(),
        ));
    }
    let layout = ChannelLayout::from_init_packet(packet, SERIAL_MODULE_MARKER);
    if layout.channel_count == 0 {
        return Err(DriverError::MalformedInitPacket(
            "no EEG modules reported".into(),
        ));
    }
    Ok(layout)
}
