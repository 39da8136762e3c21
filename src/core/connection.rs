//! Connection manager
//!
//! Owns at most one active transport. Connect and disconnect are serialized
//! so a connect issued while another lifecycle operation is in flight waits
//! for it. Sends may race a disconnect; they observe the closed state and
//! become no-ops.

use super::command::Frame;
use super::transport::{
    Endpoint, HardwareFactory, TransportError, TransportFactory, TransportStats, TransportTrait,
};
use crate::config::AppConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No link
    Disconnected,
    /// Link being established
    Connecting,
    /// Link up
    Connected,
    /// Last connect attempt failed
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Connection status event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Status after the change
    pub status: ConnectionStatus,
    /// Endpoint the event concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_description: Option<String>,
    /// Transport error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Connect errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// `connect` called before an endpoint was selected
    #[error("No endpoint selected")]
    NoEndpointSelected,

    /// The transport refused the connection
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What happened to a frame handed to [`ConnectionManager::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Written; carries the byte count
    Sent(usize),
    /// No active connection, nothing written
    Skipped,
    /// The write failed and was logged
    Dropped(TransportError),
}

impl Delivery {
    /// Whether the frame reached the transport
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }
}

struct ActiveConnection {
    endpoint: Endpoint,
    transport: Box<dyn TransportTrait>,
}

/// Single-connection state machine
pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    selected: RwLock<Option<Endpoint>>,
    active: Mutex<Option<ActiveConnection>>,
    lifecycle: Mutex<()>,
    status: RwLock<ConnectionStatus>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Manager building transports through `factory`
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            factory,
            selected: RwLock::new(None),
            active: Mutex::new(None),
            lifecycle: Mutex::new(()),
            status: RwLock::new(ConnectionStatus::Disconnected),
            event_tx,
        }
    }

    /// Manager using the serial and BLE hardware transports
    pub fn with_hardware(config: &AppConfig) -> Self {
        Self::new(Arc::new(HardwareFactory::new(config.clone())))
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Record the endpoint the next `connect` uses
    pub fn select_endpoint(&self, endpoint: Endpoint) {
        debug!(%endpoint, "Endpoint selected");
        *self.selected.write() = Some(endpoint);
    }

    /// Currently selected endpoint
    pub fn selected(&self) -> Option<Endpoint> {
        self.selected.read().clone()
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// Whether a link is up
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Endpoint of the active connection
    pub async fn connected_endpoint(&self) -> Option<Endpoint> {
        self.active.lock().await.as_ref().map(|c| c.endpoint.clone())
    }

    /// Transport description of the active connection
    pub async fn connection_info(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|c| c.transport.connection_info())
    }

    /// Statistics of the active transport
    pub async fn stats(&self) -> Option<TransportStats> {
        self.active.lock().await.as_ref().map(|c| c.transport.stats())
    }

    fn set_status(
        &self,
        status: ConnectionStatus,
        endpoint: Option<&Endpoint>,
        error_message: Option<String>,
    ) {
        *self.status.write() = status;
        let _ = self.event_tx.send(ConnectionEvent {
            status,
            endpoint_description: endpoint.map(ToString::to_string),
            error_message,
        });
    }

    /// Connect to the selected endpoint, tearing down any existing link first
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let _lifecycle = self.lifecycle.lock().await;
        let endpoint = self.selected().ok_or(ConnectError::NoEndpointSelected)?;

        self.teardown().await;
        self.set_status(ConnectionStatus::Connecting, Some(&endpoint), None);
        info!(%endpoint, "Connecting");

        let mut transport = self.factory.create(endpoint.kind);
        if let Err(e) = transport.connect(&endpoint).await {
            warn!(%endpoint, error = %e, "Connect failed");
            self.set_status(ConnectionStatus::Failed, Some(&endpoint), Some(e.to_string()));
            return Err(e.into());
        }

        // A missing write target is resolved again on the first send.
        if let Err(e) = transport.prepare().await {
            warn!(%endpoint, error = %e, "Could not prepare link, will retry on send");
        }

        *self.active.lock().await = Some(ActiveConnection {
            endpoint: endpoint.clone(),
            transport,
        });
        self.set_status(ConnectionStatus::Connected, Some(&endpoint), None);
        info!(%endpoint, "Connected");
        Ok(())
    }

    /// Close the active link. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    /// Close whatever is open, swallowing errors, and settle on `Disconnected`
    async fn teardown(&self) {
        let previous = self.active.lock().await.take();
        match previous {
            Some(mut connection) => {
                *self.status.write() = ConnectionStatus::Disconnected;
                if let Err(e) = connection.transport.disconnect().await {
                    warn!(endpoint = %connection.endpoint, error = %e, "Disconnect failed");
                }
                info!(endpoint = %connection.endpoint, "Disconnected");
                self.set_status(ConnectionStatus::Disconnected, Some(&connection.endpoint), None);
            }
            None if self.status() != ConnectionStatus::Disconnected => {
                self.set_status(ConnectionStatus::Disconnected, None, None);
            }
            None => {}
        }
    }

    /// Hand `frame` to the active transport. Never fails: a closed link skips
    /// the frame and a failed write is logged and reported as an event.
    pub async fn send(&self, frame: &Frame) -> Delivery {
        if !self.is_connected() {
            debug!(%frame, "Not connected, frame skipped");
            return Delivery::Skipped;
        }

        let mut active = self.active.lock().await;
        let Some(connection) = active.as_mut() else {
            return Delivery::Skipped;
        };

        match connection.transport.send(frame.as_bytes()).await {
            Ok(n) => {
                debug!(%frame, bytes = n, "Frame sent");
                Delivery::Sent(n)
            }
            Err(e) => {
                warn!(endpoint = %connection.endpoint, %frame, error = %e, "Send failed, frame dropped");
                let _ = self.event_tx.send(ConnectionEvent {
                    status: ConnectionStatus::Connected,
                    endpoint_description: Some(connection.endpoint.to_string()),
                    error_message: Some(format!("Send failed: {e}")),
                });
                Delivery::Dropped(e)
            }
        }
    }
}
