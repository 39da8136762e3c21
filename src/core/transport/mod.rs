//! Transport layer for the two Bluetooth link types
//!
//! Supports:
//! - Classic Bluetooth serial (SPP modules such as HC-05/HC-06) through a
//!   serial device path
//! - Bluetooth Low Energy, writing to the first writable GATT characteristic
//! - An in-memory virtual robot for dry runs and tests
//!
//! Callers hold a `Box<dyn TransportTrait>` and never branch on the variant;
//! the endpoint kind only decides which variant the factory builds.

mod ble;
mod serial;
mod virtual_device;

pub use ble::{first_writable, BleScanner, BleTransport};
pub use serial::{describe_port, is_bluetooth_serial, SerialScanner, SerialTransport};
pub use virtual_device::{VirtualFactory, VirtualLog, VirtualScanner, VirtualTransport, WireEvent};

use crate::config::AppConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(test)]
use mockall::automock;

/// Transport kind of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Classic Bluetooth serial port
    Serial,
    /// Bluetooth Low Energy peripheral
    Ble,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Ble => write!(f, "BLE"),
        }
    }
}

/// A discovered, connectable device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Transport kind
    pub kind: EndpointKind,
    /// Device path (serial) or peripheral address (BLE)
    pub identifier: String,
    /// Human-readable name
    pub display_name: String,
}

impl Endpoint {
    /// Serial endpoint
    pub fn serial(path: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Serial,
            identifier: path.into(),
            display_name: display_name.into(),
        }
    }

    /// BLE endpoint
    pub fn ble(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Ble,
            identifier: address.into(),
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.kind, self.display_name, self.identifier)
    }
}

/// Transport error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportErrorKind {
    /// Serial device could not be opened
    OpenFailed,
    /// BLE connection could not be established
    ConnectFailed,
    /// Peripheral exposes nothing writable
    NoWritableCharacteristic,
    /// A write or close failed
    IoFailed,
    /// Operation needs an open link
    NotConnected,
}

/// Transport error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Opening the serial device failed (busy, permission, missing)
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// GATT connection failed or timed out
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// No characteristic advertises write or write-without-response
    #[error("No writable characteristic found")]
    NoWritableCharacteristic,

    /// Write or close failed
    #[error("I/O error: {0}")]
    IoFailed(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// Category of this error
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Self::OpenFailed(_) => TransportErrorKind::OpenFailed,
            Self::ConnectFailed(_) => TransportErrorKind::ConnectFailed,
            Self::NoWritableCharacteristic => TransportErrorKind::NoWritableCharacteristic,
            Self::IoFailed(_) => TransportErrorKind::IoFailed,
            Self::NotConnected => TransportErrorKind::NotConnected,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoFailed(err.to_string())
    }
}

/// Discovery errors, one per scanner
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Serial enumeration failed or timed out
    #[error("Serial enumeration failed: {0}")]
    Serial(String),

    /// BLE scan failed (no adapter, permission)
    #[error("BLE scan failed: {0}")]
    Ble(String),
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Frames sent
    pub frames_sent: u64,
    /// Failed writes
    pub errors: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// Transport trait for both link types
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportTrait: Send + Sync {
    /// Open the link to `endpoint`
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Resolve whatever the link needs before the first write.
    /// BLE caches its write characteristic here; serial has nothing to do.
    async fn prepare(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the link
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Write one frame
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Get the endpoint kind this transport serves
    fn kind(&self) -> EndpointKind;

    /// Get connection info string
    fn connection_info(&self) -> String;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}

/// Builds a transport for an endpoint kind
pub trait TransportFactory: Send + Sync {
    /// New, unconnected transport
    fn create(&self, kind: EndpointKind) -> Box<dyn TransportTrait>;
}

impl<F> TransportFactory for F
where
    F: Fn(EndpointKind) -> Box<dyn TransportTrait> + Send + Sync,
{
    fn create(&self, kind: EndpointKind) -> Box<dyn TransportTrait> {
        self(kind)
    }
}

/// Factory for the hardware transports, configured from [`AppConfig`]
#[derive(Debug, Clone, Default)]
pub struct HardwareFactory {
    config: AppConfig,
}

impl HardwareFactory {
    /// Create a factory
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for HardwareFactory {
    fn create(&self, kind: EndpointKind) -> Box<dyn TransportTrait> {
        create_transport(kind, &self.config)
    }
}

/// Create a transport instance for `kind`
pub fn create_transport(kind: EndpointKind, config: &AppConfig) -> Box<dyn TransportTrait> {
    match kind {
        EndpointKind::Serial => Box::new(SerialTransport::new(config.serial.clone())),
        EndpointKind::Ble => Box::new(BleTransport::new(config.ble.clone())),
    }
}

/// Discovery side of a transport: finds endpoints of one kind
#[async_trait]
pub trait EndpointScanner: Send + Sync {
    /// Kind of endpoints this scanner reports
    fn kind(&self) -> EndpointKind;

    /// Scan for at most `timeout`, pushing each endpoint into `found` as soon
    /// as it is seen. Returns how many endpoints were reported.
    async fn scan(
        &self,
        timeout: Duration,
        found: mpsc::UnboundedSender<Endpoint>,
    ) -> Result<usize, DiscoveryError>;
}
