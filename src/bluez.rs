//! BlueZ implementation of the BLE backend (Linux).
//!
//! bluer is async; the driver API is blocking. The backend owns a tokio
//! runtime and bridges with `block_on`, while scan results and
//! notifications are pumped by tasks spawned on that runtime.

use std::collections::HashMap;
use std::time::Duration;

use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Device, Session};
use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bluetooth::{BleBackend, BlePeripheral, GattService, NotifyCallback, ScanCallback};
use crate::errors::{BluetoothError, DriverError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn adapter_err(e: impl std::fmt::Display) -> DriverError {
    BluetoothError::Adapter(e.to_string()).into()
}

fn gatt_err(e: impl std::fmt::Display) -> DriverError {
    BluetoothError::Gatt(e.to_string()).into()
}

// ============================================================================
// Adapter
// ============================================================================

pub struct BluezBackend {
    runtime: Runtime,
    session: Option<Session>,
    adapter: Option<Adapter>,
    scan_task: Option<JoinHandle<()>>,
}

impl BluezBackend {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| adapter_err(format!("tokio runtime init failed: {e}")))?;
        Ok(Self {
            runtime,
            session: None,
            adapter: None,
            scan_task: None,
        })
    }

    fn session(&mut self) -> Result<Session> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let session = self
            .runtime
            .block_on(Session::new())
            .map_err(|e| adapter_err(format!("bluer session failed: {e}")))?;
        self.session = Some(session.clone());
        Ok(session)
    }

    fn adapter(&self) -> Result<Adapter> {
        self.adapter
            .clone()
            .ok_or_else(|| adapter_err("adapter not opened"))
    }
}

impl BleBackend for BluezBackend {
    type Peripheral = BluezPeripheral;

    fn adapter_count(&mut self) -> Result<usize> {
        let session = self.session()?;
        let names = self
            .runtime
            .block_on(session.adapter_names())
            .map_err(adapter_err)?;
        Ok(names.len())
    }

    fn open_adapter(&mut self, index: usize) -> Result<()> {
        let session = self.session()?;
        let names = self
            .runtime
            .block_on(session.adapter_names())
            .map_err(adapter_err)?;
        let name = names
            .get(index)
            .ok_or_else(|| adapter_err(format!("no adapter at index {index}")))?;
        let adapter = session.adapter(name).map_err(adapter_err)?;
        if let Err(e) = self.runtime.block_on(adapter.set_powered(true)) {
            warn!("failed to power on adapter {}: {}", adapter.name(), e);
        }
        info!("using bluetooth adapter {}", adapter.name());
        self.adapter = Some(adapter);
        Ok(())
    }

    fn is_enabled(&mut self) -> bool {
        let Ok(adapter) = self.adapter() else {
            return false;
        };
        self.runtime
            .block_on(adapter.is_powered())
            .unwrap_or(false)
    }

    fn start_scan(&mut self, on_found: ScanCallback<BluezPeripheral>) -> Result<()> {
        let adapter = self.adapter()?;
        let handle = self.runtime.handle().clone();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        let task = self.runtime.spawn(async move {
            let events = match adapter.discover_devices().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(address) else {
                    continue;
                };
                let name = device.name().await.ok().flatten().unwrap_or_default();
                trace!("discovered {} ({})", address, name);
                on_found(BluezPeripheral::new(device, name, handle.clone()));
            }
        });
        self.scan_task = Some(task);

        match self.runtime.block_on(ready_rx) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BluetoothError::Scan(e).into()),
            Err(_) => Err(BluetoothError::Scan("scan task ended early".into()).into()),
        }
    }

    fn stop_scan(&mut self) -> Result<()> {
        // dropping the discovery stream inside the task ends the scan
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn release_adapter(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        self.adapter = None;
        self.session = None;
    }
}

// ============================================================================
// Peripheral
// ============================================================================

pub struct BluezPeripheral {
    device: Device,
    name: String,
    handle: Handle,
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
    subscriptions: HashMap<(Uuid, Uuid), JoinHandle<()>>,
}

impl BluezPeripheral {
    fn new(device: Device, name: String, handle: Handle) -> Self {
        Self {
            device,
            name,
            handle,
            characteristics: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    fn characteristic(&mut self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        if self.characteristics.is_empty() {
            self.services()?;
        }
        self.characteristics
            .get(&(service, characteristic))
            .cloned()
            .ok_or_else(|| gatt_err(format!("characteristic {characteristic} not found")))
    }
}

impl BlePeripheral for BluezPeripheral {
    fn identifier(&self) -> String {
        self.name.clone()
    }

    fn address(&self) -> String {
        self.device.address().to_string()
    }

    fn connect(&mut self) -> Result<()> {
        let device = self.device.clone();
        self.handle.block_on(async move {
            tokio::time::timeout(CONNECT_TIMEOUT, device.connect())
                .await
                .map_err(|_| BluetoothError::Connection("connect timed out".into()))?
                .map_err(|e| BluetoothError::Connection(e.to_string()))?;

            let waited = tokio::time::timeout(SERVICES_RESOLVE_TIMEOUT, async {
                while !device.is_services_resolved().await.unwrap_or(false) {
                    tokio::time::sleep(SERVICES_POLL_INTERVAL).await;
                }
            })
            .await;
            if waited.is_err() {
                warn!("services not resolved after {:?}", SERVICES_RESOLVE_TIMEOUT);
            }
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Result<()> {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
        self.handle
            .block_on(self.device.disconnect())
            .map_err(|e| BluetoothError::Connection(e.to_string()).into())
    }

    fn is_connected(&mut self) -> Result<bool> {
        self.handle
            .block_on(self.device.is_connected())
            .map_err(|e| BluetoothError::Connection(e.to_string()).into())
    }

    fn services(&mut self) -> Result<Vec<GattService>> {
        let device = self.device.clone();
        let resolved = self.handle.block_on(async move {
            let mut resolved = Vec::new();
            for service in device.services().await? {
                let service_uuid = service.uuid().await?;
                let mut chars = Vec::new();
                for ch in service.characteristics().await? {
                    chars.push((ch.uuid().await?, ch));
                }
                resolved.push((service_uuid, chars));
            }
            Ok::<_, bluer::Error>(resolved)
        });
        let resolved = resolved.map_err(gatt_err)?;

        self.characteristics.clear();
        let mut services = Vec::with_capacity(resolved.len());
        for (service_uuid, chars) in resolved {
            let mut uuids = Vec::with_capacity(chars.len());
            for (uuid, ch) in chars {
                uuids.push(uuid);
                self.characteristics.insert((service_uuid, uuid), ch);
            }
            debug!("service {} has {} characteristics", service_uuid, uuids.len());
            services.push(GattService {
                uuid: service_uuid,
                characteristics: uuids,
            });
        }
        Ok(services)
    }

    fn write_command(&mut self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        if !self.is_connected()? {
            return Err(BluetoothError::NotConnected(self.address()).into());
        }
        let ch = self.characteristic(service, characteristic)?;
        let request = CharacteristicWriteRequest {
            op_type: WriteOp::Command,
            ..Default::default()
        };
        self.handle
            .block_on(ch.write_ext(data, &request))
            .map_err(gatt_err)
    }

    fn subscribe(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        on_data: NotifyCallback,
    ) -> Result<()> {
        let ch = self.characteristic(service, characteristic)?;
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let task = self.handle.spawn(async move {
            let stream = match ch.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let mut stream = Box::pin(stream);
            while let Some(payload) = stream.next().await {
                on_data(&payload);
            }
            debug!("notification stream ended");
        });
        match self.handle.block_on(ready_rx) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(gatt_err(e)),
            Err(_) => return Err(gatt_err("notification task ended early")),
        }
        if let Some(previous) = self.subscriptions.insert((service, characteristic), task) {
            previous.abort();
        }
        Ok(())
    }

    fn unsubscribe(&mut self, service: Uuid, characteristic: Uuid) -> Result<()> {
        match self.subscriptions.remove(&(service, characteristic)) {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(gatt_err(format!("not subscribed to {characteristic}"))),
        }
    }
}

impl Drop for BluezPeripheral {
    fn drop(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}
