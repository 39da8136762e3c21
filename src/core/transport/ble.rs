//! Bluetooth Low Energy transport
//!
//! Connects to a peripheral by address and writes frames to the first
//! characteristic that advertises write or write-without-response. The
//! characteristic is resolved once per connection and cached; a send with an
//! empty cache resolves it on demand.

use super::{
    DiscoveryError, Endpoint, EndpointKind, EndpointScanner, TransportError, TransportStats,
    TransportTrait,
};
use crate::config::BleSettings;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// First adapter of the platform manager
async fn default_adapter() -> Result<Adapter, String> {
    let manager = Manager::new()
        .await
        .map_err(|e| format!("Failed to create Bluetooth manager: {e}"))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| format!("Failed to get adapters: {e}"))?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| "No Bluetooth adapter found".to_string())
}

/// First characteristic, in enumeration order, that accepts writes
pub fn first_writable<'a, I>(services: I) -> Option<Characteristic>
where
    I: IntoIterator<Item = &'a Service>,
{
    let writable = CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE;
    services
        .into_iter()
        .flat_map(|service| service.characteristics.iter())
        .find(|c| c.properties.intersects(writable))
        .cloned()
}

/// Enumerate the peripheral's services and pick its write target
async fn discover_writable(peripheral: &Peripheral) -> Result<Characteristic, TransportError> {
    peripheral
        .discover_services()
        .await
        .map_err(|e| TransportError::IoFailed(format!("Failed to discover services: {e}")))?;

    let characteristic =
        first_writable(&peripheral.services()).ok_or(TransportError::NoWritableCharacteristic)?;
    debug!(uuid = %characteristic.uuid, service = %characteristic.service_uuid, "Write characteristic resolved");
    Ok(characteristic)
}

/// Return the cached characteristic, or run `resolve` and cache its result.
/// A failed resolve leaves the cache empty so the next call tries again.
async fn cached_or_resolve<F, Fut>(
    cache: &mut Option<Characteristic>,
    resolve: F,
) -> Result<Characteristic, TransportError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Characteristic, TransportError>>,
{
    if let Some(characteristic) = cache {
        return Ok(characteristic.clone());
    }
    let characteristic = resolve().await?;
    *cache = Some(characteristic.clone());
    Ok(characteristic)
}

fn write_type(characteristic: &Characteristic) -> WriteType {
    if characteristic
        .properties
        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

/// Bluetooth BLE transport
pub struct BleTransport {
    config: BleSettings,
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    address: Option<String>,
    write_char: Option<Characteristic>,
    stats: Arc<RwLock<TransportStats>>,
    connected_at: Option<Instant>,
}

impl BleTransport {
    /// Create a new BLE transport
    pub fn new(config: BleSettings) -> Self {
        Self {
            config,
            adapter: None,
            peripheral: None,
            address: None,
            write_char: None,
            stats: Arc::new(RwLock::new(TransportStats::default())),
            connected_at: None,
        }
    }

    /// Find a peripheral by id or hardware address in the adapter cache
    async fn lookup(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, TransportError> {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("Failed to get peripherals: {e}")))?;

        Ok(peripherals.into_iter().find(|p| {
            p.id().to_string().eq_ignore_ascii_case(address)
                || p.address().to_string().eq_ignore_ascii_case(address)
        }))
    }

    /// Cached lookup, falling back to a short scan
    async fn find_peripheral(&self, adapter: &Adapter, address: &str) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = Self::lookup(adapter, address).await? {
            return Ok(peripheral);
        }

        debug!(address, "Peripheral not cached, rescanning");
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("Failed to start scan: {e}")))?;
        tokio::time::sleep(self.config.lookup_scan()).await;
        let found = Self::lookup(adapter, address).await;
        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        found?.ok_or_else(|| TransportError::ConnectFailed(format!("Device '{address}' not found")))
    }

    /// Enumerate services and cache the first writable characteristic
    pub async fn resolve_writable_characteristic(&mut self) -> Result<Characteristic, TransportError> {
        let peripheral = self.peripheral.as_ref().ok_or(TransportError::NotConnected)?;
        self.write_char = None;
        cached_or_resolve(&mut self.write_char, || discover_writable(peripheral)).await
    }

    /// Cached characteristic, resolving it if absent
    async fn write_target(&mut self) -> Result<Characteristic, TransportError> {
        let peripheral = self.peripheral.as_ref().ok_or(TransportError::NotConnected)?;
        cached_or_resolve(&mut self.write_char, || discover_writable(peripheral)).await
    }
}

#[async_trait]
impl TransportTrait for BleTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let adapter = default_adapter().await.map_err(TransportError::ConnectFailed)?;
        let address = endpoint.identifier.as_str();
        let peripheral = self.find_peripheral(&adapter, address).await?;

        let timeout = self.config.connect_timeout();
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| TransportError::ConnectFailed(format!("Connection timeout after {timeout:?}")))?
            .map_err(|e| TransportError::ConnectFailed(format!("Failed to connect: {e}")))?;

        self.adapter = Some(adapter);
        self.peripheral = Some(peripheral);
        self.address = Some(address.to_string());
        self.write_char = None;
        self.connected_at = Some(Instant::now());
        *self.stats.write() = TransportStats::default();

        info!(address, "BLE peripheral connected");
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), TransportError> {
        self.resolve_writable_characteristic().await.map(|_| ())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.write_char = None;
        self.connected_at = None;
        self.adapter = None;

        if let Some(peripheral) = self.peripheral.take() {
            peripheral
                .disconnect()
                .await
                .map_err(|e| TransportError::IoFailed(format!("Failed to disconnect: {e}")))?;
            debug!(address = ?self.address, "BLE peripheral disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.peripheral.is_some() && self.connected_at.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let characteristic = self.write_target().await?;
        let peripheral = self.peripheral.as_ref().ok_or(TransportError::NotConnected)?;

        let result = peripheral
            .write(&characteristic, data, write_type(&characteristic))
            .await;

        let mut stats = self.stats.write();
        match result {
            Ok(()) => {
                stats.bytes_sent += data.len() as u64;
                stats.frames_sent += 1;
                Ok(data.len())
            }
            Err(e) => {
                stats.errors += 1;
                Err(TransportError::IoFailed(format!("Write failed: {e}")))
            }
        }
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Ble
    }

    fn connection_info(&self) -> String {
        match (&self.address, &self.write_char) {
            (Some(address), Some(characteristic)) if self.is_connected() => {
                format!("BLE: {} (write {})", address, characteristic.uuid)
            }
            (Some(address), None) if self.is_connected() => format!("BLE: {address}"),
            _ => "BLE (disconnected)".to_string(),
        }
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.read().clone();
        if let Some(connected_at) = self.connected_at {
            stats.uptime_secs = connected_at.elapsed().as_secs();
        }
        stats
    }
}

/// BLE scanner for discovering peripherals
#[derive(Debug, Clone, Default)]
pub struct BleScanner;

impl BleScanner {
    /// Create a new scanner
    pub fn new() -> Self {
        Self
    }

    async fn endpoint_for(peripheral: &Peripheral, limit: Duration) -> Endpoint {
        let local_name = async {
            match peripheral.properties().await {
                Ok(Some(props)) => props.local_name,
                _ => None,
            }
        };
        labelled_endpoint(peripheral.id().to_string(), local_name, limit).await
    }
}

/// Longest wait for a peripheral's advertised name
const NAME_LOOKUP_LIMIT: Duration = Duration::from_millis(500);

/// Endpoint named after its advertised local name, or after its address
/// when the name is missing or does not arrive within `limit`
async fn labelled_endpoint<F>(address: String, local_name: F, limit: Duration) -> Endpoint
where
    F: Future<Output = Option<String>>,
{
    let name = tokio::time::timeout(limit, local_name).await.ok().flatten();
    Endpoint::ble(address.clone(), name.unwrap_or(address))
}

#[async_trait]
impl EndpointScanner for BleScanner {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Ble
    }

    async fn scan(
        &self,
        timeout: Duration,
        found: mpsc::UnboundedSender<Endpoint>,
    ) -> Result<usize, DiscoveryError> {
        let adapter = default_adapter().await.map_err(DiscoveryError::Ble)?;
        let mut events = adapter
            .events()
            .await
            .map_err(|e| DiscoveryError::Ble(format!("Failed to subscribe to events: {e}")))?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| DiscoveryError::Ble(format!("Failed to start scan: {e}")))?;

        let mut seen = HashSet::new();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let event = tokio::select! {
                () = tokio::time::sleep_until(deadline) => break,
                event = events.next() => event,
            };
            let id = match event {
                Some(CentralEvent::DeviceDiscovered(id)) => id,
                Some(_) => continue,
                None => break,
            };
            if !seen.insert(id.clone()) {
                continue;
            }

            // Name lookups share the scan window.
            let Ok(lookup) = tokio::time::timeout_at(deadline, adapter.peripheral(&id)).await else {
                break;
            };
            let Ok(peripheral) = lookup else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let endpoint = Self::endpoint_for(&peripheral, remaining.min(NAME_LOOKUP_LIMIT)).await;
            if found.send(endpoint).is_err() {
                break;
            }
        }

        // Peripherals already known to the adapter do not emit a discovery event.
        match adapter.peripherals().await {
            Ok(peripherals) => {
                for peripheral in peripherals {
                    if seen.insert(peripheral.id()) {
                        let _ = found.send(Self::endpoint_for(&peripheral, NAME_LOOKUP_LIMIT).await);
                    }
                }
            }
            Err(e) => warn!("Failed to list cached peripherals: {}", e),
        }

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        Ok(seen.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn characteristic(service: u128, uuid: u128, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid: Uuid::from_u128(uuid),
            service_uuid: Uuid::from_u128(service),
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    fn service(uuid: u128, characteristics: Vec<Characteristic>) -> Service {
        Service {
            uuid: Uuid::from_u128(uuid),
            primary: true,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    #[test]
    fn test_first_writable_skips_read_only() {
        let services = vec![
            service(0x1800, vec![characteristic(0x1800, 0x2a00, CharPropFlags::READ)]),
            service(
                0xffe0,
                vec![
                    characteristic(0xffe0, 0xffe1, CharPropFlags::NOTIFY),
                    characteristic(
                        0xffe0,
                        0xffe2,
                        CharPropFlags::READ | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                    ),
                    characteristic(0xffe0, 0xffe3, CharPropFlags::WRITE),
                ],
            ),
        ];
        let found = first_writable(&services).unwrap();
        assert_eq!(found.uuid, Uuid::from_u128(0xffe2));
        assert!(matches!(write_type(&found), WriteType::WithoutResponse));
    }

    #[test]
    fn test_first_writable_none() {
        let services = vec![service(0x180f, vec![characteristic(0x180f, 0x2a19, CharPropFlags::READ)])];
        assert!(first_writable(&services).is_none());
        assert!(first_writable(&Vec::<Service>::new()).is_none());
    }

    #[test]
    fn test_write_with_response_when_only_write() {
        let c = characteristic(0xffe0, 0xffe1, CharPropFlags::WRITE);
        assert!(matches!(write_type(&c), WriteType::WithResponse));
    }

    fn writable(uuid: u128) -> Characteristic {
        characteristic(0xffe0, uuid, CharPropFlags::WRITE)
    }

    #[tokio::test]
    async fn test_empty_cache_resolves_then_reuses() {
        let mut cache = None;
        let calls = std::cell::Cell::new(0);

        let resolved = cached_or_resolve(&mut cache, || async {
            calls.set(calls.get() + 1);
            Ok(writable(0xffe1))
        })
        .await;
        assert_eq!(resolved.unwrap().uuid, Uuid::from_u128(0xffe1));
        assert_eq!(cache.as_ref().map(|c| c.uuid), Some(Uuid::from_u128(0xffe1)));

        let reused = cached_or_resolve(&mut cache, || async {
            calls.set(calls.get() + 1);
            Ok(writable(0xffe2))
        })
        .await;
        assert_eq!(reused.unwrap().uuid, Uuid::from_u128(0xffe1));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_resolve_retried_on_next_send() {
        let mut cache = None;

        let failed = cached_or_resolve(&mut cache, || async {
            Err(TransportError::NoWritableCharacteristic)
        })
        .await;
        assert_eq!(failed, Err(TransportError::NoWritableCharacteristic));
        assert!(cache.is_none());

        let retried = cached_or_resolve(&mut cache, || async { Ok(writable(0xffe3)) }).await;
        assert_eq!(retried.unwrap().uuid, Uuid::from_u128(0xffe3));
        assert!(cache.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_name_lookup_falls_back_to_address() {
        let started = tokio::time::Instant::now();
        let endpoint = labelled_endpoint(
            "AA:BB".to_string(),
            std::future::pending::<Option<String>>(),
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(endpoint, Endpoint::ble("AA:BB", "AA:BB"));
        assert_eq!(started.elapsed(), Duration::from_millis(300));

        let named = labelled_endpoint(
            "AA:BB".to_string(),
            async { Some("Robot".to_string()) },
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(named, Endpoint::ble("AA:BB", "Robot"));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let mut transport = BleTransport::new(BleSettings::default());
        assert_eq!(transport.send(b"F142\n").await, Err(TransportError::NotConnected));
        assert_eq!(
            transport.resolve_writable_characteristic().await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.connection_info(), "BLE (disconnected)");
        assert!(transport.disconnect().await.is_ok());
    }
}
