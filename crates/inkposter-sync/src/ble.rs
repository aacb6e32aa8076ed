//! # btleplug Transport
//!
//! [`LinkTransport`] over the platform BLE stack. Enabled with the
//! `btleplug` feature.
//!
//! ```text
//!   Adapter ──scan──► CentralEvent stream ──filter (InkP- / service)──► PresenceEvent
//!      │
//!      └── peripherals() ── match address ──► Peripheral
//!                                               ├─ connect + discover_services
//!                                               ├─ read  (STATUS_CHAR_UUID)
//!                                               └─ write (COMMAND_CHAR_UUID, with response)
//! ```

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::link::{
    matches_discovery, same_address, LinkConnection, LinkTransport, PresenceEvent,
    COMMAND_CHAR_UUID, STATUS_CHAR_UUID,
};

impl From<btleplug::Error> for SyncError {
    fn from(err: btleplug::Error) -> Self {
        SyncError::LinkFailed(err.to_string())
    }
}

/// BLE transport bound to one device address.
#[derive(Clone)]
pub struct BtleplugTransport {
    adapter: Adapter,
    address: String,
}

impl BtleplugTransport {
    /// Uses the first adapter the platform reports.
    pub async fn first_adapter(address: impl Into<String>) -> SyncResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::LinkUnavailable("no bluetooth adapter found".into()))?;

        Ok(BtleplugTransport {
            adapter,
            address: address.into(),
        })
    }

    /// Starts scanning and forwards matching advertisements for this
    /// device into `tx` until the receiver is dropped.
    pub async fn start_presence(&self, tx: mpsc::Sender<PresenceEvent>) -> SyncResult<JoinHandle<()>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!(address = %self.address, "BLE scan started");

        let transport = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let presence = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        transport.advertisement(&id).await
                    }
                    CentralEvent::DeviceDisconnected(id) => transport.unavailable(&id).await,
                    _ => None,
                };

                if let Some(presence) = presence {
                    if tx.send(presence).await.is_err() {
                        debug!("Presence receiver dropped, stopping scan loop");
                        break;
                    }
                }
            }

            if let Err(e) = transport.adapter.stop_scan().await {
                warn!(?e, "Failed to stop BLE scan");
            }
        }))
    }

    async fn advertisement(&self, id: &PeripheralId) -> Option<PresenceEvent> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok().flatten()?;
        let address = properties.address.to_string();

        if !same_address(&address, &self.address)
            || !matches_discovery(properties.local_name.as_deref(), &properties.services)
        {
            return None;
        }

        Some(PresenceEvent::Advertisement {
            address,
            name: properties.local_name,
        })
    }

    async fn unavailable(&self, id: &PeripheralId) -> Option<PresenceEvent> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let address = peripheral.address().to_string();
        same_address(&address, &self.address).then_some(PresenceEvent::Unavailable { address })
    }

    async fn find_peripheral(&self) -> SyncResult<Option<Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| same_address(&p.address().to_string(), &self.address)))
    }
}

#[async_trait]
impl LinkTransport for BtleplugTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn is_connectable(&self) -> bool {
        matches!(self.find_peripheral().await, Ok(Some(_)))
    }

    async fn connect(&self, timeout: Duration) -> SyncResult<Box<dyn LinkConnection>> {
        let peripheral = self.find_peripheral().await?.ok_or_else(|| {
            SyncError::LinkUnavailable(format!("{} has not been seen by the adapter", self.address))
        })?;

        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| SyncError::LinkUnavailable(format!("connect to {} timed out", self.address)))?
            .map_err(|e| SyncError::LinkUnavailable(e.to_string()))?;

        let characteristics = match discover(&peripheral).await {
            Ok(found) => found,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
        };

        Ok(Box::new(BtleplugConnection {
            peripheral,
            status_char: characteristics.0,
            command_char: characteristics.1,
            closed: false,
        }))
    }
}

async fn discover(peripheral: &Peripheral) -> SyncResult<(Characteristic, Characteristic)> {
    peripheral.discover_services().await?;
    let chars = peripheral.characteristics();

    let find = |uuid: uuid::Uuid| {
        chars
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| SyncError::LinkFailed(format!("characteristic {} not found", uuid)))
    };

    Ok((find(STATUS_CHAR_UUID)?, find(COMMAND_CHAR_UUID)?))
}

struct BtleplugConnection {
    peripheral: Peripheral,
    status_char: Characteristic,
    command_char: Characteristic,
    closed: bool,
}

#[async_trait]
impl LinkConnection for BtleplugConnection {
    async fn read_status(&mut self) -> SyncResult<Vec<u8>> {
        Ok(self.peripheral.read(&self.status_char).await?)
    }

    async fn write_command(&mut self, bytes: &[u8], with_response: bool) -> SyncResult<()> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        Ok(self
            .peripheral
            .write(&self.command_char, bytes, write_type)
            .await?)
    }

    async fn disconnect(&mut self) -> SyncResult<()> {
        self.closed = true;
        Ok(self.peripheral.disconnect().await?)
    }
}

impl Drop for BtleplugConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped mid-run (cancelled): release the link in the background.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let peripheral = self.peripheral.clone();
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    warn!(?e, "Background disconnect failed");
                }
            });
        }
    }
}
