//! Device registry
//!
//! Runs every configured scanner concurrently and merges their results into
//! one list of selectable endpoints. Results are published as they arrive so
//! observers can render the list incrementally. Each discovery replaces the
//! previous list.

use super::transport::{BleScanner, Endpoint, EndpointKind, EndpointScanner, SerialScanner};
use crate::config::AppConfig;
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A discovery run started; the list is now empty
    DiscoveryStarted,
    /// An endpoint was added to the list
    EndpointFound(Endpoint),
    /// One scanner failed; the others keep going
    ScanFailed {
        /// Scanner kind
        kind: EndpointKind,
        /// Error message
        message: String,
    },
    /// Every scanner finished
    DiscoveryFinished {
        /// Endpoints in the list
        count: usize,
    },
}

/// Per-kind scan bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Upper bound for serial enumeration
    pub serial_timeout: Duration,
    /// BLE scan window
    pub ble_scan_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl DiscoveryOptions {
    /// Options from the configured timeouts
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            serial_timeout: config.serial.enumeration_timeout(),
            ble_scan_timeout: config.ble.scan_timeout(),
        }
    }

    fn timeout_for(&self, kind: EndpointKind) -> Duration {
        match kind {
            EndpointKind::Serial => self.serial_timeout,
            EndpointKind::Ble => self.ble_scan_timeout,
        }
    }
}

/// Merged list of discovered endpoints plus the operator's selection
#[derive(Clone)]
pub struct DeviceRegistry {
    scanners: Vec<Arc<dyn EndpointScanner>>,
    endpoints: Arc<RwLock<Vec<Endpoint>>>,
    selected: Arc<RwLock<Option<Endpoint>>>,
    generation: Arc<AtomicU64>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Registry over the given scanners
    pub fn new(scanners: Vec<Arc<dyn EndpointScanner>>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            scanners,
            endpoints: Arc::new(RwLock::new(Vec::new())),
            selected: Arc::new(RwLock::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            event_tx,
        }
    }

    /// Registry scanning Bluetooth serial ports and BLE peripherals
    pub fn with_hardware(config: &AppConfig) -> Self {
        let serial: Arc<dyn EndpointScanner> = Arc::new(SerialScanner::new(&config.serial));
        let ble: Arc<dyn EndpointScanner> = Arc::new(BleScanner::new());
        Self::new(vec![serial, ble])
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Clear the list, run every scanner concurrently and return the merged
    /// result. Scanner failures are reported as events and leave the other
    /// scanners' results in place.
    pub async fn discover(&self, options: DiscoveryOptions) -> Vec<Endpoint> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.endpoints.write().clear();
        let _ = self.event_tx.send(RegistryEvent::DiscoveryStarted);
        info!(generation, scanners = self.scanners.len(), "Discovery started");

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let scans = join_all(self.scanners.iter().map(|scanner| {
            let scanner = Arc::clone(scanner);
            let found_tx = found_tx.clone();
            let timeout = options.timeout_for(scanner.kind());
            async move { (scanner.kind(), scanner.scan(timeout, found_tx).await) }
        }));
        // Receiver closes once every scan has dropped its sender.
        drop(found_tx);

        let merge = async {
            while let Some(endpoint) = found_rx.recv().await {
                self.add(generation, endpoint);
            }
        };

        let (results, ()) = tokio::join!(scans, merge);

        for (kind, result) in results {
            match result {
                Ok(count) => debug!(%kind, count, "Scanner finished"),
                Err(e) => {
                    warn!(%kind, error = %e, "Scanner failed");
                    let _ = self.event_tx.send(RegistryEvent::ScanFailed {
                        kind,
                        message: e.to_string(),
                    });
                }
            }
        }

        let endpoints = self.endpoints();
        if self.generation.load(Ordering::SeqCst) == generation {
            info!(count = endpoints.len(), "Discovery finished");
            let _ = self.event_tx.send(RegistryEvent::DiscoveryFinished {
                count: endpoints.len(),
            });
        }
        endpoints
    }

    /// Run [`discover`](Self::discover) on a background task
    pub fn spawn_discover(&self, options: DiscoveryOptions) -> JoinHandle<Vec<Endpoint>> {
        let registry = self.clone();
        tokio::spawn(async move { registry.discover(options).await })
    }

    fn add(&self, generation: u64, endpoint: Endpoint) {
        // A newer run owns the list now.
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut endpoints = self.endpoints.write();
            let duplicate = endpoints
                .iter()
                .any(|e| e.kind == endpoint.kind && e.identifier == endpoint.identifier);
            if duplicate {
                return;
            }
            endpoints.push(endpoint.clone());
        }
        debug!(%endpoint, "Endpoint found");
        let _ = self.event_tx.send(RegistryEvent::EndpointFound(endpoint));
    }

    /// Snapshot of the current list
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }

    /// Record the operator's choice
    pub fn select(&self, endpoint: Endpoint) {
        *self.selected.write() = Some(endpoint);
    }

    /// Select the endpoint at `index` in the current list
    pub fn select_index(&self, index: usize) -> Option<Endpoint> {
        let endpoint = self.endpoints.read().get(index).cloned()?;
        self.select(endpoint.clone());
        Some(endpoint)
    }

    /// Drop the selection
    pub fn clear_selection(&self) {
        *self.selected.write() = None;
    }

    /// Current selection
    pub fn selected(&self) -> Option<Endpoint> {
        self.selected.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::VirtualScanner;

    fn registry(scanners: Vec<VirtualScanner>) -> DeviceRegistry {
        DeviceRegistry::new(
            scanners
                .into_iter()
                .map(|s| Arc::new(s) as Arc<dyn EndpointScanner>)
                .collect(),
        )
    }

    fn options() -> DiscoveryOptions {
        DiscoveryOptions {
            serial_timeout: Duration::from_secs(2),
            ble_scan_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_merges_both_kinds() {
        let registry = registry(vec![
            VirtualScanner::new(EndpointKind::Serial, vec![Endpoint::serial("COM5", "HC-05")]),
            VirtualScanner::new(
                EndpointKind::Ble,
                vec![Endpoint::ble("AA", "Robot"), Endpoint::ble("BB", "")],
            ),
        ]);

        let endpoints = registry.discover(options()).await;
        assert_eq!(endpoints.len(), 3);
        assert_eq!(
            endpoints.iter().filter(|e| e.kind == EndpointKind::Ble).count(),
            2
        );
    }

    /// Reports a different batch on each scan
    struct RotatingScanner {
        batches: parking_lot::Mutex<std::collections::VecDeque<Vec<Endpoint>>>,
    }

    #[async_trait::async_trait]
    impl EndpointScanner for RotatingScanner {
        fn kind(&self) -> EndpointKind {
            EndpointKind::Serial
        }

        async fn scan(
            &self,
            _timeout: Duration,
            found: mpsc::UnboundedSender<Endpoint>,
        ) -> Result<usize, crate::core::transport::DiscoveryError> {
            let batch = self.batches.lock().pop_front().unwrap_or_default();
            for endpoint in &batch {
                let _ = found.send(endpoint.clone());
            }
            Ok(batch.len())
        }
    }

    #[tokio::test]
    async fn test_second_discovery_replaces_list() {
        let scanner: Arc<dyn EndpointScanner> = Arc::new(RotatingScanner {
            batches: parking_lot::Mutex::new(
                vec![
                    vec![Endpoint::serial("COM5", "HC-05"), Endpoint::serial("COM6", "HC-06")],
                    vec![Endpoint::serial("COM7", "HC-05")],
                ]
                .into(),
            ),
        });
        let registry = DeviceRegistry::new(vec![scanner]);

        assert_eq!(registry.discover(options()).await.len(), 2);
        let endpoints = registry.discover(options()).await;
        assert_eq!(endpoints, vec![Endpoint::serial("COM7", "HC-05")]);
        assert_eq!(registry.endpoints(), endpoints);
    }

    #[tokio::test]
    async fn test_no_devices_is_empty_not_error() {
        let registry = registry(vec![
            VirtualScanner::new(EndpointKind::Serial, vec![]),
            VirtualScanner::new(EndpointKind::Ble, vec![]),
        ]);
        let mut events = registry.subscribe();

        assert!(registry.discover(options()).await.is_empty());
        assert_eq!(events.recv().await.unwrap(), RegistryEvent::DiscoveryStarted);
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::DiscoveryFinished { count: 0 }
        );
    }

    #[tokio::test]
    async fn test_failed_scanner_keeps_partial_results() {
        let registry = registry(vec![
            VirtualScanner::new(EndpointKind::Serial, vec![Endpoint::serial("COM5", "HC-05")]),
            VirtualScanner::new(EndpointKind::Ble, vec![]).failing("no adapter"),
        ]);
        let mut events = registry.subscribe();

        let endpoints = registry.discover(options()).await;
        assert_eq!(endpoints, vec![Endpoint::serial("COM5", "HC-05")]);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&RegistryEvent::ScanFailed {
            kind: EndpointKind::Ble,
            message: "BLE scan failed: no adapter".to_string(),
        }));
        assert_eq!(seen.last(), Some(&RegistryEvent::DiscoveryFinished { count: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_arrive_incrementally() {
        let registry = registry(vec![
            VirtualScanner::new(EndpointKind::Serial, vec![Endpoint::serial("COM5", "HC-05")]),
            VirtualScanner::new(
                EndpointKind::Ble,
                vec![Endpoint::ble("AA", "first"), Endpoint::ble("BB", "late")],
            )
            .with_interval(Duration::from_secs(2)),
        ]);
        let mut events = registry.subscribe();
        let handle = registry.spawn_discover(DiscoveryOptions {
            serial_timeout: Duration::from_secs(2),
            ble_scan_timeout: Duration::from_secs(3),
        });

        assert_eq!(events.recv().await.unwrap(), RegistryEvent::DiscoveryStarted);
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::EndpointFound(Endpoint::serial("COM5", "HC-05"))
        );
        // Serial result is visible before the BLE scan window closes.
        assert_eq!(registry.endpoints().len(), 1);

        // The second BLE result falls outside the scan window.
        let endpoints = handle.await.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert!(!endpoints.iter().any(|e| e.identifier == "BB"));
    }

    #[tokio::test]
    async fn test_duplicates_are_merged() {
        let registry = registry(vec![
            VirtualScanner::new(EndpointKind::Ble, vec![Endpoint::ble("AA", "Robot")]),
            VirtualScanner::new(EndpointKind::Ble, vec![Endpoint::ble("AA", "Robot (cached)")]),
        ]);
        assert_eq!(registry.discover(options()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_selection_survives_discovery() {
        let registry = registry(vec![VirtualScanner::new(
            EndpointKind::Serial,
            vec![Endpoint::serial("COM5", "HC-05")],
        )]);
        assert!(registry.select_index(0).is_none());

        registry.discover(options()).await;
        let chosen = registry.select_index(0).unwrap();
        registry.discover(options()).await;
        assert_eq!(registry.selected(), Some(chosen));

        registry.clear_selection();
        assert!(registry.selected().is_none());
    }
}
