//! Virtual robot
//!
//! An in-memory transport that records every wire event instead of touching
//! hardware. Backs `--dry-run` in the CLI and the test suites. Failures can
//! be injected per endpoint (refused connects) and per frame (dropped
//! writes).

use super::{
    DiscoveryError, Endpoint, EndpointKind, EndpointScanner, TransportError, TransportFactory,
    TransportStats, TransportTrait,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Something observed on the virtual link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Link opened
    Connected(Endpoint),
    /// Write target resolved
    Prepared(Endpoint),
    /// Frame delivered
    Frame {
        /// Receiving endpoint identifier
        identifier: String,
        /// Raw bytes
        data: Vec<u8>,
    },
    /// Link closed
    Disconnected(Endpoint),
}

/// Shared, ordered record of wire events
#[derive(Debug, Clone, Default)]
pub struct VirtualLog {
    events: Arc<Mutex<Vec<WireEvent>>>,
}

impl VirtualLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: WireEvent) {
        self.events.lock().push(event);
    }

    /// All events so far
    pub fn events(&self) -> Vec<WireEvent> {
        self.events.lock().clone()
    }

    /// Delivered frames, in order
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                WireEvent::Frame { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Delivered frames without terminators, e.g. `["F142", "S"]`
    pub fn frame_symbols(&self) -> Vec<String> {
        self.frames()
            .iter()
            .map(|data| {
                String::from_utf8_lossy(data)
                    .trim_end_matches(['\r', '\n'])
                    .to_string()
            })
            .collect()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// In-memory transport
pub struct VirtualTransport {
    kind: EndpointKind,
    log: VirtualLog,
    endpoint: Option<Endpoint>,
    refuse: HashMap<String, String>,
    drop_sends: HashSet<u64>,
    attempts: u64,
    stats: TransportStats,
}

impl VirtualTransport {
    /// Create a transport recording into `log`
    pub fn new(kind: EndpointKind, log: VirtualLog) -> Self {
        Self {
            kind,
            log,
            endpoint: None,
            refuse: HashMap::new(),
            drop_sends: HashSet::new(),
            attempts: 0,
            stats: TransportStats::default(),
        }
    }

    /// Refuse connections to `identifier` with `message`
    #[must_use]
    pub fn refuse(mut self, identifier: impl Into<String>, message: impl Into<String>) -> Self {
        self.refuse.insert(identifier.into(), message.into());
        self
    }

    /// Fail the given send attempts (0-based, counted per connection)
    #[must_use]
    pub fn drop_sends(mut self, attempts: impl IntoIterator<Item = u64>) -> Self {
        self.drop_sends.extend(attempts);
        self
    }
}

#[async_trait]
impl TransportTrait for VirtualTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if let Some(message) = self.refuse.get(&endpoint.identifier) {
            return Err(match self.kind {
                EndpointKind::Serial => TransportError::OpenFailed(message.clone()),
                EndpointKind::Ble => TransportError::ConnectFailed(message.clone()),
            });
        }
        self.endpoint = Some(endpoint.clone());
        self.attempts = 0;
        self.stats = TransportStats::default();
        self.log.push(WireEvent::Connected(endpoint.clone()));
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), TransportError> {
        let endpoint = self.endpoint.clone().ok_or(TransportError::NotConnected)?;
        self.log.push(WireEvent::Prepared(endpoint));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(endpoint) = self.endpoint.take() {
            self.log.push(WireEvent::Disconnected(endpoint));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotConnected)?;
        let attempt = self.attempts;
        self.attempts += 1;

        if self.drop_sends.contains(&attempt) {
            self.stats.errors += 1;
            return Err(TransportError::IoFailed(format!("virtual write {attempt} dropped")));
        }

        info!(endpoint = %endpoint.identifier, frame = %data.escape_ascii(), "Virtual robot received frame");
        self.log.push(WireEvent::Frame {
            identifier: endpoint.identifier.clone(),
            data: data.to_vec(),
        });
        self.stats.bytes_sent += data.len() as u64;
        self.stats.frames_sent += 1;
        Ok(data.len())
    }

    fn kind(&self) -> EndpointKind {
        self.kind
    }

    fn connection_info(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("virtual {}: {}", self.kind, endpoint.identifier),
            None => format!("virtual {} (disconnected)", self.kind),
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Factory producing virtual transports that share one log
#[derive(Debug, Clone, Default)]
pub struct VirtualFactory {
    log: VirtualLog,
    refuse: HashMap<String, String>,
    drop_sends: HashSet<u64>,
}

impl VirtualFactory {
    /// Create a factory recording into `log`
    pub fn new(log: VirtualLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Refuse connections to `identifier`
    #[must_use]
    pub fn refuse(mut self, identifier: impl Into<String>, message: impl Into<String>) -> Self {
        self.refuse.insert(identifier.into(), message.into());
        self
    }

    /// Fail the given send attempts on every created transport
    #[must_use]
    pub fn drop_sends(mut self, attempts: impl IntoIterator<Item = u64>) -> Self {
        self.drop_sends.extend(attempts);
        self
    }
}

impl TransportFactory for VirtualFactory {
    fn create(&self, kind: EndpointKind) -> Box<dyn TransportTrait> {
        let mut transport = VirtualTransport::new(kind, self.log.clone())
            .drop_sends(self.drop_sends.iter().copied());
        for (identifier, message) in &self.refuse {
            transport = transport.refuse(identifier.clone(), message.clone());
        }
        Box::new(transport)
    }
}

/// Scanner reporting a fixed list of endpoints
#[derive(Debug, Clone)]
pub struct VirtualScanner {
    kind: EndpointKind,
    endpoints: Vec<Endpoint>,
    interval: Duration,
    failure: Option<String>,
}

impl VirtualScanner {
    /// Scanner that reports `endpoints` immediately
    pub fn new(kind: EndpointKind, endpoints: Vec<Endpoint>) -> Self {
        Self {
            kind,
            endpoints,
            interval: Duration::ZERO,
            failure: None,
        }
    }

    /// Pause before each endpoint, like a radio scan trickling in results
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fail after reporting the endpoints
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

#[async_trait]
impl EndpointScanner for VirtualScanner {
    fn kind(&self) -> EndpointKind {
        self.kind
    }

    async fn scan(
        &self,
        timeout: Duration,
        found: mpsc::UnboundedSender<Endpoint>,
    ) -> Result<usize, DiscoveryError> {
        let started = tokio::time::Instant::now();
        let mut count = 0;
        for endpoint in &self.endpoints {
            if !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            if started.elapsed() > timeout {
                break;
            }
            if found.send(endpoint.clone()).is_err() {
                break;
            }
            count += 1;
        }

        match &self.failure {
            Some(message) => Err(match self.kind {
                EndpointKind::Serial => DiscoveryError::Serial(message.clone()),
                EndpointKind::Ble => DiscoveryError::Ble(message.clone()),
            }),
            None => Ok(count),
        }
    }
}
