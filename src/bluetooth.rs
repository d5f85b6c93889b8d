//! BLE discovery, connection and characteristic negotiation.
//!
//! The Axon exposes one GATT service (Nordic UART style) with exactly two
//! characteristics: one accepts commands, the other notifies data. Their
//! order is not fixed, so roles are matched by UUID rather than position.
//!
//! The BLE stack is reached through [`BleBackend`] and [`BlePeripheral`].
//! Scan results and notifications arrive on threads owned by the backend;
//! a found peripheral is handed to the waiting caller through a one-slot
//! channel read with a timeout.
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Negotiating -> Ready <-> Streaming
//!   any step -> Failed,   any state -> Released
//! ```

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::errors::{DriverError, Result};
use crate::frame::{BLE_STOP_BYTE, START_BYTE};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Advertised-name prefix of Axon BLE boards.
pub const DEFAULT_NAME_PREFIX: &str = "NTLAxonBLE";

const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 5;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 1000;
/// Notifications must drain before unsubscribing; some stacks hang otherwise.
const SETTLE_DELAY_MS: u64 = 2000;
const UNSUBSCRIBE_ATTEMPTS: u32 = 2;

// ============================================================================
// Backend Abstraction
// ============================================================================

/// Invoked by the backend for every peripheral seen while scanning.
pub type ScanCallback<P> = Box<dyn Fn(P) + Send + Sync + 'static>;

/// Invoked by the backend for every notification payload.
pub type NotifyCallback = Arc<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// A GATT service and the UUIDs of its characteristics, in advertised order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Adapter-level BLE primitives.
pub trait BleBackend: Send {
    type Peripheral: BlePeripheral;

    fn adapter_count(&mut self) -> Result<usize>;
    fn open_adapter(&mut self, index: usize) -> Result<()>;
    fn is_enabled(&mut self) -> bool;
    /// Start scanning; `on_found` runs on a backend-owned thread.
    fn start_scan(&mut self, on_found: ScanCallback<Self::Peripheral>) -> Result<()>;
    fn stop_scan(&mut self) -> Result<()>;
    fn release_adapter(&mut self);
}

/// Peripheral-level BLE primitives. Dropping the value releases the handle.
pub trait BlePeripheral: Send + 'static {
    /// Advertised name (platform identifier).
    fn identifier(&self) -> String;
    fn address(&self) -> String;
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&mut self) -> Result<bool>;
    fn services(&mut self) -> Result<Vec<GattService>>;
    /// Write without response.
    fn write_command(&mut self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;
    fn subscribe(&mut self, service: Uuid, characteristic: Uuid, on_data: NotifyCallback)
        -> Result<()>;
    fn unsubscribe(&mut self, service: Uuid, characteristic: Uuid) -> Result<()>;
}

// ============================================================================
// Data Types
// ============================================================================

/// Which advertising peripheral to accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdentityFilter {
    MacAddress(String),
    SerialNumber(String),
    NamePrefix(String),
}

impl DeviceIdentityFilter {
    /// Pick the filter from optional session parameters. A MAC address wins
    /// over a serial number, which wins over the default name prefix.
    pub fn from_params(mac_address: Option<&str>, serial_number: Option<&str>) -> Self {
        match (
            mac_address.filter(|s| !s.is_empty()),
            serial_number.filter(|s| !s.is_empty()),
        ) {
            (Some(mac), _) => Self::MacAddress(mac.to_string()),
            (None, Some(serial)) => Self::SerialNumber(serial.to_string()),
            (None, None) => Self::NamePrefix(DEFAULT_NAME_PREFIX.to_string()),
        }
    }

    pub fn matches(&self, address: &str, identifier: &str) -> bool {
        match self {
            Self::MacAddress(mac) => address.eq_ignore_ascii_case(mac),
            Self::SerialNumber(serial) => identifier == serial,
            Self::NamePrefix(prefix) => identifier.starts_with(prefix.as_str()),
        }
    }
}

impl Default for DeviceIdentityFilter {
    fn default() -> Self {
        Self::NamePrefix(DEFAULT_NAME_PREFIX.to_string())
    }
}

/// Negotiated write and notify endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicBinding {
    pub service: Uuid,
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Negotiating,
    Ready,
    Streaming,
    Failed,
    Released,
}

/// Firmware command dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandVariant {
    /// Single-letter commands (`b`/`h`).
    #[default]
    Short,
    /// Spelled-out commands (`start`/`stop`).
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleCommand {
    Start,
    Stop,
}

impl BleCommand {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    /// Wire bytes, framed with the start and stop markers.
    pub fn bytes(self, variant: CommandVariant) -> Vec<u8> {
        match (self, variant) {
            (Self::Start, CommandVariant::Short) => vec![START_BYTE, b'b', BLE_STOP_BYTE],
            (Self::Stop, CommandVariant::Short) => vec![START_BYTE, b'h', BLE_STOP_BYTE],
            (Self::Start, CommandVariant::Verbose) => {
                let mut cmd = vec![START_BYTE];
                cmd.extend_from_slice(b"start");
                cmd.extend_from_slice(&[START_BYTE, BLE_STOP_BYTE]);
                cmd
            }
            (Self::Stop, CommandVariant::Verbose) => {
                let mut cmd = vec![START_BYTE];
                cmd.extend_from_slice(b"stop");
                cmd.extend_from_slice(&[START_BYTE, BLE_STOP_BYTE]);
                cmd
            }
        }
    }
}

/// Timing and retry policy for BLE sessions.
#[derive(Debug, Clone)]
pub struct BleConfig {
    pub scan_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub settle_delay: Duration,
    pub unsubscribe_attempts: u32,
    pub command_variant: CommandVariant,
    /// Modules assumed until the board announces its layout.
    pub default_module_count: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            settle_delay: Duration::from_millis(SETTLE_DELAY_MS),
            unsubscribe_attempts: UNSUBSCRIBE_ATTEMPTS,
            command_variant: CommandVariant::default(),
            default_module_count: 1,
        }
    }
}

/// Match the two advertised characteristics to their write and notify roles.
pub fn negotiate(service: &GattService) -> Result<CharacteristicBinding> {
    let [first, second] = service.characteristics.as_slice() else {
        return Err(DriverError::CharacteristicMismatch(format!(
            "expected 2 characteristics, found {}",
            service.characteristics.len()
        )));
    };
    if first == second {
        return Err(DriverError::CharacteristicMismatch(
            "characteristics are not distinct".into(),
        ));
    }

    let (write, notify) = if *first == WRITE_CHARACTERISTIC_UUID {
        (*first, *second)
    } else if *second == WRITE_CHARACTERISTIC_UUID {
        (*second, *first)
    } else {
        return Err(DriverError::CharacteristicMismatch(
            "no control characteristic".into(),
        ));
    };
    if notify != NOTIFY_CHARACTERISTIC_UUID {
        return Err(DriverError::CharacteristicMismatch(format!(
            "unexpected notify characteristic {notify}"
        )));
    }

    Ok(CharacteristicBinding {
        service: service.uuid,
        write_characteristic: write,
        notify_characteristic: notify,
    })
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Owns the adapter and peripheral for one BLE session.
pub struct BleConnectionManager<B: BleBackend> {
    backend: B,
    config: BleConfig,
    state: ConnectionState,
    adapter_open: bool,
    peripheral: Option<B::Peripheral>,
    binding: Option<CharacteristicBinding>,
}

impl<B: BleBackend> BleConnectionManager<B> {
    pub fn new(backend: B, config: BleConfig) -> Self {
        Self {
            backend,
            config,
            state: ConnectionState::Idle,
            adapter_open: false,
            peripheral: None,
            binding: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn binding(&self) -> Option<CharacteristicBinding> {
        self.binding
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    /// Discover, connect and negotiate, then subscribe `on_data` to the
    /// notify characteristic. `timeout_secs < 1` uses the configured default.
    pub fn prepare(
        &mut self,
        filter: &DeviceIdentityFilter,
        timeout_secs: u64,
        on_data: NotifyCallback,
    ) -> Result<CharacteristicBinding> {
        if let (ConnectionState::Ready | ConnectionState::Streaming, Some(binding)) =
            (self.state, self.binding)
        {
            info!("session already prepared");
            return Ok(binding);
        }
        let timeout = if timeout_secs < 1 {
            self.config.scan_timeout
        } else {
            Duration::from_secs(timeout_secs)
        };

        match self.try_prepare(filter, timeout, on_data) {
            Ok(binding) => {
                self.binding = Some(binding);
                self.state = ConnectionState::Ready;
                Ok(binding)
            }
            Err(e) => {
                error!("BLE prepare failed: {}", e);
                self.teardown();
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    fn try_prepare(
        &mut self,
        filter: &DeviceIdentityFilter,
        timeout: Duration,
        on_data: NotifyCallback,
    ) -> Result<CharacteristicBinding> {
        if self.backend.adapter_count()? == 0 {
            error!("no BLE adapters found");
            return Err(DriverError::NoAdapter);
        }
        self.backend.open_adapter(0)?;
        self.adapter_open = true;
        if !self.backend.is_enabled() {
            // some stacks misreport this, keep going
            warn!("bluetooth appears disabled");
        }

        let mut peripheral = self.discover(filter, timeout)?;
        self.connect_with_retries(&mut peripheral)?;
        self.peripheral = Some(peripheral);

        self.state = ConnectionState::Negotiating;
        let binding = self.negotiate_characteristics()?;

        let peripheral = self
            .peripheral
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("peripheral released".into()))?;
        peripheral
            .subscribe(binding.service, binding.notify_characteristic, on_data)
            .map_err(|e| {
                error!("failed to subscribe to notify characteristic: {}", e);
                DriverError::SubscribeFailed(e.to_string())
            })?;
        info!(
            "BLE session ready: address={}, service={}",
            peripheral.address(),
            binding.service
        );
        Ok(binding)
    }

    fn discover(
        &mut self,
        filter: &DeviceIdentityFilter,
        timeout: Duration,
    ) -> Result<B::Peripheral> {
        let (tx, rx) = mpsc::sync_channel(1);
        // held so a backend dropping its callback early still waits out the timeout
        let _hold = tx.clone();
        self.backend.start_scan(scan_callback(filter.clone(), tx))?;
        self.state = ConnectionState::Scanning;
        debug!("scanning for {:?} (timeout: {:?})", filter, timeout);

        let found = rx.recv_timeout(timeout);
        if let Err(e) = self.backend.stop_scan() {
            warn!("failed to stop scan: {}", e);
        }
        match found {
            Ok(peripheral) => {
                info!(
                    "found Axon board: name={}, address={}",
                    peripheral.identifier(),
                    peripheral.address()
                );
                Ok(peripheral)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(DriverError::DeviceNotFound { timeout })
            }
        }
    }

    fn connect_with_retries(&mut self, peripheral: &mut B::Peripheral) -> Result<()> {
        self.state = ConnectionState::Connecting;
        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                thread::sleep(self.config.retry_delay);
            }
            match peripheral.connect() {
                Ok(()) => {
                    info!("connected to Axon board: address={}", peripheral.address());
                    return Ok(());
                }
                Err(e) => warn!(
                    "connection attempt failed: address={}, attempt={}, error={}",
                    peripheral.address(),
                    attempt,
                    e
                ),
            }
        }
        Err(DriverError::ConnectFailed {
            attempts: self.config.max_retries,
        })
    }

    fn negotiate_characteristics(&mut self) -> Result<CharacteristicBinding> {
        let peripheral = self
            .peripheral
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("peripheral released".into()))?;
        let services = peripheral.services().map_err(|e| {
            DriverError::CharacteristicMismatch(format!("failed to get services: {e}"))
        })?;
        let service = services
            .iter()
            .find(|s| s.uuid == SERVICE_UUID)
            .or_else(|| services.first())
            .ok_or_else(|| DriverError::CharacteristicMismatch("no GATT service".into()))?;
        trace!("negotiating service {:?}", service);

        let binding = negotiate(service)?;
        info!(
            "found control characteristic: write={}, notify={}",
            binding.write_characteristic, binding.notify_characteristic
        );
        Ok(binding)
    }

    /// Send a named command (`start` or `stop`) to the write characteristic.
    pub fn send_command(&mut self, name: &str) -> Result<()> {
        if !matches!(
            self.state,
            ConnectionState::Ready | ConnectionState::Streaming
        ) {
            return Err(DriverError::NotReady(format!(
                "cannot send {name:?} in state {:?}",
                self.state
            )));
        }
        let Some(command) = BleCommand::from_name(name) else {
            error!("unknown command: {}", name);
            return Err(DriverError::InvalidArgument(format!("unknown command {name:?}")));
        };
        let (Some(binding), Some(peripheral)) = (self.binding, self.peripheral.as_mut()) else {
            return Err(DriverError::NotReady("no negotiated characteristics".into()));
        };

        let bytes = command.bytes(self.config.command_variant);
        debug!("sending {:?} as {:02X?}", command, bytes);
        peripheral
            .write_command(binding.service, binding.write_characteristic, &bytes)
            .map_err(|e| {
                error!("failed to send command {} to device: {}", name, e);
                DriverError::WriteFailed(e.to_string())
            })
    }

    pub fn start_streaming(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => {}
            ConnectionState::Streaming => return Err(DriverError::StreamAlreadyRunning),
            state => {
                return Err(DriverError::NotReady(format!(
                    "cannot start streaming in state {state:?}"
                )))
            }
        }
        self.send_command("start")?;
        self.state = ConnectionState::Streaming;
        Ok(())
    }

    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.state != ConnectionState::Streaming {
            return Err(DriverError::StreamNotRunning);
        }
        // the board is treated as stopped even if the command is lost
        self.state = ConnectionState::Ready;
        self.send_command("stop")
    }

    /// Tear down subscription, connection and adapter. Every step runs even
    /// if an earlier one failed. Safe to call repeatedly and from any state.
    pub fn release(&mut self) {
        if self.state == ConnectionState::Released {
            return;
        }
        self.teardown();
        self.state = ConnectionState::Released;
    }

    fn teardown(&mut self) {
        if self.state == ConnectionState::Streaming {
            if let Err(e) = self.send_command("stop") {
                warn!("failed to stop streaming during release: {}", e);
            }
            self.state = ConnectionState::Ready;
        }
        if let Some(binding) = self.binding.take() {
            thread::sleep(self.config.settle_delay);
            self.unsubscribe(&binding);
        }

        if let Some(mut peripheral) = self.peripheral.take() {
            match peripheral.is_connected() {
                Ok(true) => {
                    if let Err(e) = peripheral.disconnect() {
                        warn!("failed to disconnect {}: {}", peripheral.address(), e);
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("connectivity check failed: {}", e),
            }
            drop(peripheral);
        }

        if self.adapter_open {
            self.backend.release_adapter();
            self.adapter_open = false;
        }
    }

    fn unsubscribe(&mut self, binding: &CharacteristicBinding) {
        let Some(peripheral) = self.peripheral.as_mut() else {
            return;
        };
        for attempt in 0..self.config.unsubscribe_attempts.max(1) {
            match peripheral.unsubscribe(binding.service, binding.notify_characteristic) {
                Ok(()) => return,
                Err(e) => error!(
                    "failed to unsubscribe {} {} (attempt {}): {}",
                    binding.service, binding.notify_characteristic, attempt, e
                ),
            }
        }
    }
}

impl<B: BleBackend> Drop for BleConnectionManager<B> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Accept the first peripheral matching `filter` and hand it over exactly
/// once. Rejected and late peripherals are dropped on the spot.
fn scan_callback<P: BlePeripheral>(
    filter: DeviceIdentityFilter,
    tx: SyncSender<P>,
) -> ScanCallback<P> {
    let slot = Mutex::new(Some(tx));
    Box::new(move |peripheral: P| {
        let address = peripheral.address();
        let identifier = peripheral.identifier();
        trace!("scan result: address={}, identifier={}", address, identifier);
        if !filter.matches(&address, &identifier) {
            return;
        }
        let sender = slot.lock().ok().and_then(|mut slot| slot.take());
        if let Some(tx) = sender {
            if tx.try_send(peripheral).is_err() {
                debug!("scan result arrived after the wait ended: {}", address);
            }
        }
    })
}
