use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("no BLE adapter found")]
    NoAdapter,
    #[error("no matching device found within {timeout:?}")]
    DeviceNotFound { timeout: Duration },
    #[error("connection failed after {attempts} attempts")]
    ConnectFailed { attempts: u32 },
    #[error("characteristic mismatch: {0}")]
    CharacteristicMismatch(String),
    #[error("failed to subscribe to notifications: {0}")]
    SubscribeFailed(String),
    #[error("port {0} is already open")]
    PortAlreadyOpen(String),
    #[error("unable to open port {port}: {reason}")]
    UnableToOpen { port: String, reason: String },
    #[error("unable to set port settings: {0}")]
    SetPortError(String),
    #[error("board not ready: {0}")]
    BoardNotReady(String),
    #[error("malformed initialization packet: {0}")]
    MalformedInitPacket(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session not ready: {0}")]
    NotReady(String),
    #[error("stream already running")]
    StreamAlreadyRunning,
    #[error("stream not running")]
    StreamNotRunning,
}

/// Failures reported by a BLE backend before the driver classifies them.
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("scan error: {0}")]
    Scan(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("gatt error: {0}")]
    Gatt(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
