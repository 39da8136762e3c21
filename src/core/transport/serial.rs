//! Serial port transport implementation (Bluetooth SPP modules)

use super::{
    DiscoveryError, Endpoint, EndpointKind, EndpointScanner, TransportError, TransportStats,
    TransportTrait,
};
use crate::config::SerialSettings;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Serial port transport
pub struct SerialTransport {
    config: SerialSettings,
    port: Arc<Mutex<Option<Box<dyn SerialPort + Send>>>>,
    path: Option<String>,
    stats: Arc<RwLock<TransportStats>>,
    connected_at: Option<Instant>,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(config: SerialSettings) -> Self {
        Self {
            config,
            port: Arc::new(Mutex::new(None)),
            path: None,
            stats: Arc::new(RwLock::new(TransportStats::default())),
            connected_at: None,
        }
    }
}

fn open_error(path: &str, err: &serialport::Error) -> TransportError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => {
            TransportError::OpenFailed(format!("{path}: device not found or busy"))
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::OpenFailed(format!("{path}: permission denied"))
        }
        _ => TransportError::OpenFailed(format!("{path}: {err}")),
    }
}

#[async_trait]
impl TransportTrait for SerialTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let path = endpoint.identifier.as_str();
        let port = serialport::new(path, self.config.baud_rate)
            .timeout(self.config.timeout())
            .open()
            .map_err(|e| open_error(path, &e))?;

        *self.port.lock() = Some(port);
        self.path = Some(path.to_string());
        self.connected_at = Some(Instant::now());
        *self.stats.write() = TransportStats::default();

        info!(port = path, baud = self.config.baud_rate, "Serial port opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        // Dropping the handle closes the descriptor.
        if self.port.lock().take().is_some() {
            debug!(port = ?self.path, "Serial port closed");
        }
        self.connected_at = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.lock().is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut port_guard = self.port.lock();
        let port = port_guard.as_mut().ok_or(TransportError::NotConnected)?;

        let result = port.write_all(data).and_then(|()| port.flush());
        drop(port_guard);

        let mut stats = self.stats.write();
        match result {
            Ok(()) => {
                stats.bytes_sent += data.len() as u64;
                stats.frames_sent += 1;
                Ok(data.len())
            }
            Err(e) => {
                stats.errors += 1;
                Err(TransportError::IoFailed(e.to_string()))
            }
        }
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Serial
    }

    fn connection_info(&self) -> String {
        match &self.path {
            Some(path) if self.is_connected() => {
                format!("{} @ {} baud", path, self.config.baud_rate)
            }
            _ => "serial (disconnected)".to_string(),
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

/// Human-readable description of an enumerated port
pub fn describe_port(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let parts: Vec<&str> = [usb.product.as_deref(), usb.manufacturer.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                "USB serial".to_string()
            } else {
                parts.join(" - ")
            }
        }
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::PciPort => "PCI serial".to_string(),
        SerialPortType::Unknown => String::new(),
    }
}

/// Case-insensitive match of the description or device path against the
/// Bluetooth-serial vendor markers
pub fn is_bluetooth_serial(description: &str, port_name: &str, markers: &[String]) -> bool {
    let description = description.to_uppercase();
    let port_name = port_name.to_uppercase();
    markers.iter().any(|marker| {
        let marker = marker.to_uppercase();
        !marker.is_empty() && (description.contains(&marker) || port_name.contains(&marker))
    })
}

/// Enumerates serial ports and keeps the Bluetooth ones
#[derive(Debug, Clone)]
pub struct SerialScanner {
    markers: Vec<String>,
}

impl SerialScanner {
    /// Create a scanner with the configured markers
    pub fn new(config: &SerialSettings) -> Self {
        Self {
            markers: config.bluetooth_markers.clone(),
        }
    }

    /// Endpoint for `info` if it looks like a Bluetooth serial port
    pub fn classify(&self, info: &SerialPortInfo) -> Option<Endpoint> {
        let description = describe_port(info);
        let bluetooth = matches!(info.port_type, SerialPortType::BluetoothPort)
            || is_bluetooth_serial(&description, &info.port_name, &self.markers);
        if !bluetooth {
            return None;
        }
        let display_name = if description.is_empty() {
            info.port_name.clone()
        } else {
            description
        };
        Some(Endpoint::serial(info.port_name.clone(), display_name))
    }
}

#[async_trait]
impl EndpointScanner for SerialScanner {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Serial
    }

    async fn scan(
        &self,
        timeout: Duration,
        found: mpsc::UnboundedSender<Endpoint>,
    ) -> Result<usize, DiscoveryError> {
        let enumeration = tokio::task::spawn_blocking(serialport::available_ports);
        let ports = tokio::time::timeout(timeout, enumeration)
            .await
            .map_err(|_| DiscoveryError::Serial(format!("timed out after {timeout:?}")))?
            .map_err(|e| DiscoveryError::Serial(e.to_string()))?
            .map_err(|e| DiscoveryError::Serial(e.to_string()))?;

        let mut count = 0;
        for info in &ports {
            if let Some(endpoint) = self.classify(info) {
                debug!(port = %info.port_name, "Bluetooth serial port found");
                if found.send(endpoint).is_err() {
                    break;
                }
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn markers() -> Vec<String> {
        SerialSettings::default().bluetooth_markers
    }

    fn usb(name: &str, product: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x1a86,
                pid: 0x7523,
                serial_number: None,
                manufacturer: None,
                product: product.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_marker_matching_is_case_insensitive() {
        assert!(is_bluetooth_serial("Standard Serial over Bluetooth link", "COM5", &markers()));
        assert!(is_bluetooth_serial("", "/dev/tty.HC-05-DevB", &markers()));
        assert!(is_bluetooth_serial("lmb adapter", "COM9", &markers()));
        assert!(is_bluetooth_serial("", "/dev/rfcomm0", &markers()));
        assert!(!is_bluetooth_serial("USB-SERIAL CH340", "/dev/ttyUSB0", &markers()));
        assert!(!is_bluetooth_serial("anything", "COM1", &[String::new()]));
    }

    #[test]
    fn test_classify_ports() {
        let scanner = SerialScanner::new(&SerialSettings::default());

        let plain = usb("/dev/ttyUSB0", Some("USB2.0-Serial"));
        assert!(scanner.classify(&plain).is_none());

        let module = usb("COM7", Some("HC-06 Bluetooth"));
        let endpoint = scanner.classify(&module).unwrap();
        assert_eq!(endpoint.kind, EndpointKind::Serial);
        assert_eq!(endpoint.identifier, "COM7");
        assert_eq!(endpoint.display_name, "HC-06 Bluetooth");

        let spp = SerialPortInfo {
            port_name: "COM12".to_string(),
            port_type: SerialPortType::BluetoothPort,
        };
        assert_eq!(scanner.classify(&spp).unwrap().display_name, "Bluetooth serial port");
    }

    #[tokio::test]
    async fn test_send_requires_open_port() {
        let mut transport = SerialTransport::new(SerialSettings::default());
        assert!(!transport.is_connected());
        assert_eq!(transport.send(b"S\n").await, Err(TransportError::NotConnected));
        assert_eq!(transport.connection_info(), "serial (disconnected)");
        // Closing an unopened port is a no-op.
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let mut transport = SerialTransport::new(SerialSettings::default());
        let endpoint = Endpoint::serial("/dev/botlink-does-not-exist", "missing");
        let err = transport.connect(&endpoint).await.unwrap_err();
        assert!(matches!(err, TransportError::OpenFailed(_)));
        assert!(!transport.is_connected());
    }
}
