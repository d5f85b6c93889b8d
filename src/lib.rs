//! NTL Axon EEG driver with optional Python bindings.
//!
//! The Axon streams multi-channel EEG either over BLE (Nordic UART GATT
//! service) or over a serial link. Both transports share one frame format
//! and one channel layout, so a session looks the same to the host:
//!
//! 1. `prepare_session()` finds the board and learns its module layout
//! 2. `start_stream()` begins delivering sample records to a [`SampleSink`]
//! 3. `stop_stream()` / `release_session()` tear down in reverse
//!
//! Each record holds `8 * modules` EEG rows followed by status, battery,
//! a host timestamp and a marker row. The layout is published to a
//! [`BoardCatalog`] whenever the board reports it.

mod axon;
mod bluetooth;
#[cfg(feature = "bluez")]
mod bluez;
mod errors;
mod frame;
mod layout;
pub mod logging;
mod serial;
mod stream;

pub use axon::{AxonBle, AxonSerial, BleParams, SerialParams, Transport};
pub use bluetooth::{
    negotiate, BleBackend, BleCommand, BleConfig, BleConnectionManager, BlePeripheral,
    CharacteristicBinding, CommandVariant, ConnectionState, DeviceIdentityFilter, GattService,
    NotifyCallback, ScanCallback, DEFAULT_NAME_PREFIX, NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID,
    WRITE_CHARACTERISTIC_UUID,
};
#[cfg(feature = "bluez")]
pub use bluez::{BluezBackend, BluezPeripheral};
pub use errors::*;
pub use frame::{
    be16, be24, decode_frame, validate_frame, FrameError, MonotonicClock, BLE_ANNOUNCEMENT_LEN,
    BLE_MODULE_MARKER, BLE_STOP_BYTE, SERIAL_MODULE_MARKER, SERIAL_STOP_BYTE, START_BYTE,
};
pub use layout::{
    BoardCatalog, BoardDescriptor, BoardId, ChannelLayout, MemoryCatalog, CHANNELS_PER_MODULE,
};
pub use serial::{
    parse_init_packet, HandshakeState, PortOpener, SerialConfig, SerialHandshakeManager,
    SerialLink, SystemPorts,
};
pub use stream::{NotificationHandler, SampleSink, SerialReader, StreamStats};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Arc;

    use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
    use pyo3::prelude::*;

    use crate::{
        AxonSerial, BoardCatalog, BoardId, DriverError, MemoryCatalog, SampleSink, SerialParams,
        Transport,
    };

    fn to_py_err(e: DriverError) -> PyErr {
        match e {
            DriverError::NoAdapter
            | DriverError::DeviceNotFound { .. }
            | DriverError::ConnectFailed { .. }
            | DriverError::Bluetooth(_) => PyConnectionError::new_err(e.to_string()),
            DriverError::InvalidArgument(_) => PyValueError::new_err(e.to_string()),
            DriverError::Io(_)
            | DriverError::Serial(_)
            | DriverError::PortAlreadyOpen(_)
            | DriverError::UnableToOpen { .. } => PyIOError::new_err(e.to_string()),
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }

    /// An Axon board session.
    ///
    /// Example:
    ///     >>> board = AxonBoard.serial("/dev/ttyUSB0")
    ///     >>> board.prepare_session()
    ///     >>> board.start_stream()
    ///     >>> rows = board.get_board_data()
    ///     >>> board.release_session()
    #[pyclass(name = "AxonBoard", unsendable)]
    struct PyAxonBoard {
        transport: Box<dyn Transport>,
        records: Receiver<Vec<f64>>,
        catalog: Arc<MemoryCatalog>,
    }

    impl PyAxonBoard {
        fn build<F>(make: F) -> PyResult<Self>
        where
            F: FnOnce(Arc<dyn SampleSink>, Arc<dyn BoardCatalog>) -> PyResult<Box<dyn Transport>>,
        {
            let (tx, records) = mpsc::channel();
            let sink = move |record: &[f64]| {
                let _ = tx.send(record.to_vec());
            };
            let catalog = Arc::new(MemoryCatalog::new());
            let transport = make(Arc::new(sink), catalog.clone())?;
            Ok(Self {
                transport,
                records,
                catalog,
            })
        }
    }

    #[pymethods]
    impl PyAxonBoard {
        /// Open a board on a serial port (e.g. `/dev/ttyUSB0`).
        #[staticmethod]
        #[pyo3(signature = (port, timeout=crate::serial::DEFAULT_HANDSHAKE_TIMEOUT_SECS))]
        fn serial(port: &str, timeout: u64) -> PyResult<Self> {
            let params = SerialParams {
                port_name: port.to_string(),
                timeout_secs: timeout,
            };
            Self::build(|sink, catalog| {
                let transport: Box<dyn Transport> =
                    Box::new(AxonSerial::system(params, sink, Some(catalog)));
                Ok(transport)
            })
        }

        /// Open a board over BLE. Without filters the first `NTLAxonBLE*`
        /// board found is used; a MAC address takes precedence over a
        /// serial number.
        #[staticmethod]
        #[pyo3(signature = (mac_address=None, serial_number=None, timeout=0))]
        fn ble(
            mac_address: Option<String>,
            serial_number: Option<String>,
            timeout: u64,
        ) -> PyResult<Self> {
            let params = crate::BleParams {
                mac_address,
                serial_number,
                timeout_secs: timeout,
            };
            Self::build(|sink, catalog| ble_transport(params, sink, catalog))
        }

        fn prepare_session(&mut self) -> PyResult<()> {
            self.transport.prepare_session().map_err(to_py_err)
        }

        fn start_stream(&mut self) -> PyResult<()> {
            self.transport.start_stream().map_err(to_py_err)
        }

        fn stop_stream(&mut self) -> PyResult<()> {
            self.transport.stop_stream().map_err(to_py_err)
        }

        fn release_session(&mut self) {
            self.transport.release_session();
        }

        fn config_board(&mut self, command: &str) -> PyResult<String> {
            self.transport.config_board(command).map_err(to_py_err)
        }

        /// Drain every record received so far.
        ///
        /// Returns:
        ///     List of records, each `num_rows` floats long.
        fn get_board_data(&self) -> Vec<Vec<f64>> {
            self.records.try_iter().collect()
        }

        /// Row layout as JSON, or `None` before the board reported it.
        fn board_descr(&self) -> PyResult<Option<String>> {
            self.catalog
                .get(self.transport.board_id())
                .map(|d| d.to_json())
                .transpose()
                .map_err(|e| PyRuntimeError::new_err(e.to_string()))
        }

        #[getter]
        fn board_id(&self) -> i32 {
            self.transport.board_id().as_i32()
        }

        fn __repr__(&self) -> String {
            match self.transport.layout() {
                Some(layout) => format!(
                    "AxonBoard(id={}, eeg_channels={})",
                    self.board_id(),
                    layout.channel_count
                ),
                None => format!("AxonBoard(id={})", self.board_id()),
            }
        }
    }

    #[cfg(feature = "bluez")]
    fn ble_transport(
        params: crate::BleParams,
        sink: Arc<dyn SampleSink>,
        catalog: Arc<dyn BoardCatalog>,
    ) -> PyResult<Box<dyn Transport>> {
        let backend = crate::BluezBackend::new().map_err(to_py_err)?;
        let transport: Box<dyn Transport> = Box::new(crate::AxonBle::new(
            backend,
            crate::BleConfig::default(),
            params,
            sink,
            Some(catalog),
        ));
        Ok(transport)
    }

    #[cfg(not(feature = "bluez"))]
    fn ble_transport(
        _params: crate::BleParams,
        _sink: Arc<dyn SampleSink>,
        _catalog: Arc<dyn BoardCatalog>,
    ) -> PyResult<Box<dyn Transport>> {
        Err(PyRuntimeError::new_err(
            "BLE support not compiled in (enable the `bluez` feature)",
        ))
    }

    /// Set the level forwarded to Python's `logging`.
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        crate::logging::set_python_log_level_str(py, level)
    }

    #[pymodule]
    fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
        crate::logging::init_python_logging(m.py())?;
        m.add_class::<PyAxonBoard>()?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
        m.add("AXON_BLE_BOARD", BoardId::AxonBle.as_i32())?;
        m.add("AXON_SERIAL_BOARD", BoardId::AxonSerial.as_i32())?;
        Ok(())
    }
}
