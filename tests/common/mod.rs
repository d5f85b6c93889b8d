#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use _core::{
    BleBackend, BleConfig, BlePeripheral, DriverError, GattService, NotifyCallback, PortOpener,
    Result, SampleSink, ScanCallback, SerialConfig, SerialLink, BLE_STOP_BYTE,
    NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, START_BYTE, WRITE_CHARACTERISTIC_UUID,
};

// ============================================================================
// Records
// ============================================================================

pub fn collecting_sink() -> (Arc<dyn SampleSink>, Arc<Mutex<Vec<Vec<f64>>>>) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&records);
    let sink = move |record: &[f64]| store.lock().unwrap().push(record.to_vec());
    (Arc::new(sink), records)
}

/// Poll until `records` holds at least `n` entries or `timeout` passes.
pub fn wait_for_records(records: &Mutex<Vec<Vec<f64>>>, n: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if records.lock().unwrap().len() >= n {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Data frame with EEG channel `i` set to `i + 1`.
pub fn data_frame(channels: usize, status: u16, battery: u8, stop: u8) -> Vec<u8> {
    let mut frame = vec![START_BYTE, 0x01];
    for ch in 0..channels {
        let v = (ch as u32 + 1).to_be_bytes();
        frame.extend_from_slice(&v[1..]);
    }
    frame.extend_from_slice(&status.to_be_bytes());
    frame.push(battery);
    frame.push(stop);
    frame
}

// ============================================================================
// Serial
// ============================================================================

struct Reply {
    command: Vec<u8>,
    bytes: Vec<u8>,
    once: bool,
}

#[derive(Default)]
struct LinkState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    replies: Vec<Reply>,
    fail_settings: bool,
}

/// In-memory serial link. Clones share one buffer, like a cloned OS handle.
#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<LinkState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `bytes` every time `command` is written.
    pub fn reply(&self, command: &str, bytes: &[u8]) {
        self.state.lock().unwrap().replies.push(Reply {
            command: command.as_bytes().to_vec(),
            bytes: bytes.to_vec(),
            once: false,
        });
    }

    /// Queue `bytes` the first time `command` is written.
    pub fn reply_once(&self, command: &str, bytes: &[u8]) {
        self.state.lock().unwrap().replies.push(Reply {
            command: command.as_bytes().to_vec(),
            bytes: bytes.to_vec(),
            once: true,
        });
    }

    pub fn fail_settings(&self) {
        self.state.lock().unwrap().fail_settings = true;
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().unwrap().written).into_owned()
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.incoming.is_empty() {
            drop(state);
            thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        // short reads on purpose
        let n = buf.len().min(state.incoming.len()).min(7);
        for slot in buf.iter_mut().take(n) {
            *slot = state.incoming.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.written.extend_from_slice(buf);
        let mut queued = Vec::new();
        state.replies.retain(|reply| {
            if reply.command == buf {
                queued.extend_from_slice(&reply.bytes);
                !reply.once
            } else {
                true
            }
        });
        state.incoming.extend(queued);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MockLink {
    fn apply_settings(&mut self, _baud_rate: u32, _timeout: Duration) -> Result<()> {
        if self.state.lock().unwrap().fail_settings {
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported baud rate",
            )));
        }
        Ok(())
    }

    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(self.clone()))
    }

    fn clear_input(&mut self) -> Result<()> {
        self.state.lock().unwrap().incoming.clear();
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    Ok,
    Busy,
    Missing,
}

pub struct MockOpener {
    pub link: MockLink,
    pub outcome: OpenOutcome,
}

impl MockOpener {
    pub fn new(link: MockLink) -> Self {
        Self {
            link,
            outcome: OpenOutcome::Ok,
        }
    }
}

impl PortOpener for MockOpener {
    fn open(&self, port_name: &str) -> Result<Box<dyn SerialLink>> {
        match self.outcome {
            OpenOutcome::Ok => Ok(Box::new(self.link.clone())),
            OpenOutcome::Busy => Err(DriverError::PortAlreadyOpen(port_name.to_string())),
            OpenOutcome::Missing => Err(DriverError::UnableToOpen {
                port: port_name.to_string(),
                reason: "No such file or directory".into(),
            }),
        }
    }
}

pub fn fast_serial_config() -> SerialConfig {
    SerialConfig {
        reset_delay: Duration::from_millis(1),
        init_delay: Duration::from_millis(1),
        init_resend_interval: Duration::from_millis(50),
        begin_repeat_delay: Duration::from_millis(1),
        poll_interval: Duration::from_millis(1),
        ..SerialConfig::default()
    }
}

// ============================================================================
// BLE
// ============================================================================

#[derive(Default)]
struct PeripheralState {
    name: String,
    address: String,
    connect_failures: u32,
    connect_attempts: u32,
    connected: bool,
    services: Vec<GattService>,
    fail_subscribe: bool,
    unsubscribe_failures: u32,
    notify: Option<NotifyCallback>,
    writes: Vec<Vec<u8>>,
    events: Vec<&'static str>,
}

/// Scripted peripheral. Clones share state so tests keep a handle to the
/// instance the driver connected to.
#[derive(Clone)]
pub struct MockPeripheral {
    state: Arc<Mutex<PeripheralState>>,
    drops: Arc<AtomicUsize>,
}

impl MockPeripheral {
    pub fn axon(name: &str, address: &str) -> Self {
        let state = PeripheralState {
            name: name.to_string(),
            address: address.to_string(),
            services: vec![GattService {
                uuid: SERVICE_UUID,
                characteristics: vec![NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID],
            }],
            ..PeripheralState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            drops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_services(self, services: Vec<GattService>) -> Self {
        self.state.lock().unwrap().services = services;
        self
    }

    pub fn failing_connects(self, failures: u32) -> Self {
        self.state.lock().unwrap().connect_failures = failures;
        self
    }

    pub fn failing_subscribe(self) -> Self {
        self.state.lock().unwrap().fail_subscribe = true;
        self
    }

    /// Drop the link from the peripheral side, as an out-of-range board would.
    pub fn lose_link(&self) {
        self.state.lock().unwrap().connected = false;
    }

    pub fn failing_unsubscribes(self, failures: u32) -> Self {
        self.state.lock().unwrap().unsubscribe_failures = failures;
        self
    }

    /// Deliver a notification as the BLE stack would.
    pub fn notify(&self, payload: &[u8]) {
        let callback = self.state.lock().unwrap().notify.clone();
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().unwrap().notify.is_some()
    }

    /// How many handles to this peripheral have been dropped so far.
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

impl Drop for MockPeripheral {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl BlePeripheral for MockPeripheral {
    fn identifier(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    fn address(&self) -> String {
        self.state.lock().unwrap().address.clone()
    }

    fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(_core::BluetoothError::Connection("link lost".into()).into());
        }
        state.connected = true;
        state.events.push("connect");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.events.push("disconnect");
        Ok(())
    }

    fn is_connected(&mut self) -> Result<bool> {
        Ok(self.state.lock().unwrap().connected)
    }

    fn services(&mut self) -> Result<Vec<GattService>> {
        Ok(self.state.lock().unwrap().services.clone())
    }

    fn write_command(
        &mut self,
        _service: uuid::Uuid,
        characteristic: uuid::Uuid,
        data: &[u8],
    ) -> Result<()> {
        assert_eq!(characteristic, WRITE_CHARACTERISTIC_UUID);
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(_core::BluetoothError::NotConnected(state.address.clone()).into());
        }
        state.writes.push(data.to_vec());
        state.events.push("write");
        Ok(())
    }

    fn subscribe(
        &mut self,
        _service: uuid::Uuid,
        characteristic: uuid::Uuid,
        on_data: NotifyCallback,
    ) -> Result<()> {
        assert_eq!(characteristic, NOTIFY_CHARACTERISTIC_UUID);
        let mut state = self.state.lock().unwrap();
        if state.fail_subscribe {
            return Err(_core::BluetoothError::Gatt("notify not permitted".into()).into());
        }
        state.notify = Some(on_data);
        state.events.push("subscribe");
        Ok(())
    }

    fn unsubscribe(&mut self, _service: uuid::Uuid, _characteristic: uuid::Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push("unsubscribe");
        if state.unsubscribe_failures > 0 {
            state.unsubscribe_failures -= 1;
            return Err(_core::BluetoothError::Gatt("busy".into()).into());
        }
        state.notify = None;
        Ok(())
    }
}

/// Scripted adapter: every scan reports `peripherals` from a background
/// thread, like a real stack's callback thread.
pub struct MockBackend {
    pub adapters: usize,
    pub peripherals: Vec<MockPeripheral>,
    pub events: Arc<Mutex<Vec<&'static str>>>,
}

impl MockBackend {
    pub fn new(peripherals: Vec<MockPeripheral>) -> Self {
        Self {
            adapters: 1,
            peripherals,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn without_adapters() -> Self {
        Self {
            adapters: 0,
            ..Self::new(Vec::new())
        }
    }

    fn record(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }
}

impl BleBackend for MockBackend {
    type Peripheral = MockPeripheral;

    fn adapter_count(&mut self) -> Result<usize> {
        Ok(self.adapters)
    }

    fn open_adapter(&mut self, _index: usize) -> Result<()> {
        self.record("open_adapter");
        Ok(())
    }

    fn is_enabled(&mut self) -> bool {
        true
    }

    fn start_scan(&mut self, on_found: ScanCallback<MockPeripheral>) -> Result<()> {
        self.record("start_scan");
        let peripherals = self.peripherals.clone();
        thread::spawn(move || {
            for peripheral in peripherals {
                thread::sleep(Duration::from_millis(5));
                on_found(peripheral);
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.record("stop_scan");
        Ok(())
    }

    fn release_adapter(&mut self) {
        self.record("release_adapter");
    }
}

pub fn fast_ble_config() -> BleConfig {
    BleConfig {
        retry_delay: Duration::from_millis(1),
        settle_delay: Duration::from_millis(1),
        ..BleConfig::default()
    }
}

pub fn ble_frame(channels: usize, status: u16, battery: u8) -> Vec<u8> {
    data_frame(channels, status, battery, BLE_STOP_BYTE)
}
