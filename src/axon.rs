//! Board-level sessions over either transport.
//!
//! [`Transport`] is the lifecycle a host drives: prepare, start, stop,
//! release. [`AxonBle`] and [`AxonSerial`] wire the matching connection
//! manager to the shared decoder and publish the channel layout to the
//! board catalog.

use std::sync::Arc;

use log::{debug, info};

use crate::bluetooth::{BleBackend, BleConfig, BleConnectionManager, DeviceIdentityFilter};
use crate::errors::Result;
use crate::layout::{BoardCatalog, BoardId, ChannelLayout};
use crate::serial::{
    PortOpener, SerialConfig, SerialHandshakeManager, SystemPorts, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
};
use crate::stream::{NotificationHandler, SampleSink, StreamStats};

/// Session lifecycle shared by both Axon transports.
pub trait Transport {
    fn board_id(&self) -> BoardId;

    fn prepare_session(&mut self) -> Result<()>;

    fn start_stream(&mut self) -> Result<()>;

    fn stop_stream(&mut self) -> Result<()>;

    /// Release every resource. Idempotent.
    fn release_session(&mut self);

    /// Send a raw board command; returns the board's reply, if any.
    fn config_board(&mut self, command: &str) -> Result<String>;

    /// Current layout, once the board has reported its modules.
    fn layout(&self) -> Option<ChannelLayout>;
}

// ============================================================================
// BLE
// ============================================================================

/// Caller-supplied BLE session parameters.
#[derive(Debug, Clone, Default)]
pub struct BleParams {
    pub mac_address: Option<String>,
    pub serial_number: Option<String>,
    /// Scan timeout in seconds; 0 uses the configured default.
    pub timeout_secs: u64,
}

impl BleParams {
    pub fn filter(&self) -> DeviceIdentityFilter {
        DeviceIdentityFilter::from_params(
            self.mac_address.as_deref(),
            self.serial_number.as_deref(),
        )
    }
}

pub struct AxonBle<B: BleBackend> {
    params: BleParams,
    manager: BleConnectionManager<B>,
    handler: Arc<NotificationHandler>,
}

impl<B: BleBackend> AxonBle<B> {
    pub fn new(
        backend: B,
        config: BleConfig,
        params: BleParams,
        sink: Arc<dyn SampleSink>,
        catalog: Option<Arc<dyn BoardCatalog>>,
    ) -> Self {
        // frames are decodable before the first announcement
        let initial = ChannelLayout::from_module_count(config.default_module_count);
        if let Some(catalog) = &catalog {
            catalog.publish(BoardId::AxonBle, initial.descriptor());
        }
        Self {
            params,
            manager: BleConnectionManager::new(backend, config),
            handler: Arc::new(NotificationHandler::new(Some(initial), sink, catalog)),
        }
    }

    pub fn manager(&self) -> &BleConnectionManager<B> {
        &self.manager
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.handler.stats()
    }
}

impl<B: BleBackend> Transport for AxonBle<B> {
    fn board_id(&self) -> BoardId {
        BoardId::AxonBle
    }

    fn prepare_session(&mut self) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let filter = self.params.filter();
        self.manager.prepare(
            &filter,
            self.params.timeout_secs,
            Arc::new(move |payload: &[u8]| handler.handle(payload)),
        )?;
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        self.manager.start_streaming()?;
        info!("BLE stream started");
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.manager.stop_streaming()?;
        let stats = self.handler.stats();
        info!(
            "BLE stream stopped: accepted={}, dropped={}",
            stats.accepted(),
            stats.dropped()
        );
        Ok(())
    }

    fn release_session(&mut self) {
        self.manager.release();
    }

    fn config_board(&mut self, command: &str) -> Result<String> {
        self.manager.send_command(command)?;
        Ok(String::new())
    }

    fn layout(&self) -> Option<ChannelLayout> {
        self.handler.layout()
    }
}

// ============================================================================
// Serial
// ============================================================================

/// Caller-supplied serial session parameters.
#[derive(Debug, Clone)]
pub struct SerialParams {
    pub port_name: String,
    /// Handshake timeout in seconds.
    pub timeout_secs: u64,
}

impl SerialParams {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

pub struct AxonSerial<O: PortOpener = SystemPorts> {
    params: SerialParams,
    manager: SerialHandshakeManager<O>,
    sink: Arc<dyn SampleSink>,
    catalog: Option<Arc<dyn BoardCatalog>>,
}

impl AxonSerial<SystemPorts> {
    pub fn system(
        params: SerialParams,
        sink: Arc<dyn SampleSink>,
        catalog: Option<Arc<dyn BoardCatalog>>,
    ) -> Self {
        Self::new(SystemPorts, SerialConfig::default(), params, sink, catalog)
    }
}

impl<O: PortOpener> AxonSerial<O> {
    pub fn new(
        opener: O,
        config: SerialConfig,
        params: SerialParams,
        sink: Arc<dyn SampleSink>,
        catalog: Option<Arc<dyn BoardCatalog>>,
    ) -> Self {
        Self {
            params,
            manager: SerialHandshakeManager::new(opener, config),
            sink,
            catalog,
        }
    }

    pub fn manager(&self) -> &SerialHandshakeManager<O> {
        &self.manager
    }

    pub fn stats(&self) -> Option<Arc<StreamStats>> {
        self.manager.stats()
    }
}

impl<O: PortOpener> Transport for AxonSerial<O> {
    fn board_id(&self) -> BoardId {
        BoardId::AxonSerial
    }

    fn prepare_session(&mut self) -> Result<()> {
        let layout = self
            .manager
            .prepare(&self.params.port_name, self.params.timeout_secs)?;
        if let Some(catalog) = &self.catalog {
            catalog.publish(BoardId::AxonSerial, layout.descriptor());
        }
        debug!("serial layout published: rows={}", layout.total_row_count);
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        self.manager.start_streaming(Arc::clone(&self.sink))?;
        info!("serial stream started on {}", self.params.port_name);
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.manager.stop_streaming()?;
        if let Some(stats) = self.manager.stats() {
            info!(
                "serial stream stopped: accepted={}, dropped={}, resync_bytes={}",
                stats.accepted(),
                stats.dropped(),
                stats.resync_bytes()
            );
        }
        Ok(())
    }

    fn release_session(&mut self) {
        self.manager.release();
    }

    fn config_board(&mut self, command: &str) -> Result<String> {
        self.manager.send_command(command, true)
    }

    fn layout(&self) -> Option<ChannelLayout> {
        self.manager.layout()
    }
}
