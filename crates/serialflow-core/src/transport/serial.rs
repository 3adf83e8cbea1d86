//! Serial port handling
//!
//! Device discovery and a [`Transport`] backed by the `serialport` crate.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{PortOpener, Transport};
use crate::config::{Parity, PortSettings};
use crate::error::SerialError;

/// Read/write timeout applied to every opened port
const PORT_TIMEOUT: Duration = Duration::from_millis(100);

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Device node prefixes probed under /dev, in listing order
const DEV_PREFIXES: [&str; 3] = ["ttyACM", "ttyUSB", "ttyS"];

/// Sort key: ttyACM*, then ttyUSB*, then ttyS* (each numerically), then the rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in DEV_PREFIXES.iter().enumerate() {
        if let Some(rest) = basename.strip_prefix(prefix) {
            if let Ok(num) = rest.parse::<usize>() {
                return (rank as u8, num, basename.to_string());
            }
        }
    }
    (DEV_PREFIXES.len() as u8, 0, basename.to_string())
}

/// List serial devices, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(found) => {
            for info in found {
                let p = PortInfo::from(info);
                map.entry(p.name.clone()).or_insert(p);
            }
        }
        Err(e) => debug!(error = %e, "serialport enumeration failed"),
    }

    // Nodes the enumeration API misses (no udev, containers)
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if DEV_PREFIXES.iter().any(|p| fname.starts_with(p)) {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

fn data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> serialport::StopBits {
    match bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn open_error(path: &str, err: serialport::Error) -> SerialError {
    match err.kind() {
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            SerialError::PermissionDenied {
                path: path.to_string(),
                reason: err.to_string(),
            }
        }
        _ => SerialError::PortOpenFailed {
            path: path.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Opens real serial devices
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn Transport>, SerialError> {
        let path = settings.device_path.as_str();
        if settings.flags != 0 {
            // serialport owns the open(2) flags; nothing to forward them to
            debug!(path, flags = settings.flags, "ignoring raw open flags");
        }

        let port = serialport::new(path, settings.baud_rate)
            .data_bits(data_bits(settings.data_bits))
            .stop_bits(stop_bits(settings.stop_bits))
            .parity(parity(settings.parity))
            .flow_control(serialport::FlowControl::None)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|e| open_error(path, e))?;

        info!(
            path,
            baud = settings.baud_rate,
            data_bits = settings.data_bits,
            stop_bits = settings.stop_bits,
            parity = ?settings.parity,
            "serial port opened"
        );
        Ok(Box::new(SerialTransport::new(port)))
    }
}

/// [`Transport`] over an open `serialport` handle
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self) -> io::Result<Option<Vec<u8>>> {
        let available = self
            .port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))? as usize;
        if available == 0 {
            return Ok(None);
        }

        let mut buf = vec![0u8; available];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        if let Err(e) = self.port.clear(serialport::ClearBuffer::All) {
            warn!(error = %e, "failed to clear port buffers on close");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_list_ports() {
        // Only checks enumeration doesn't panic and stays ordered
        let ports = list_ports();
        let keys: Vec<_> = ports.iter().map(|p| port_sort_key(&p.name)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyS1",
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyS0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo::bare(n.to_string()))
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/ttyS0",
                "/dev/ttyS1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_line_setting_mapping() {
        assert_eq!(data_bits(7), serialport::DataBits::Seven);
        assert_eq!(data_bits(8), serialport::DataBits::Eight);
        assert_eq!(stop_bits(2), serialport::StopBits::Two);
        assert_eq!(parity(Parity::Even), serialport::Parity::Even);
    }

    #[test]
    fn test_open_missing_device_fails() {
        let settings = PortSettings {
            device_path: "/dev/serialflow-does-not-exist".to_string(),
            ..PortSettings::default()
        };
        let err = SerialPortOpener.open(&settings).err();
        assert!(matches!(
            err,
            Some(SerialError::PortOpenFailed { .. }) | Some(SerialError::PermissionDenied { .. })
        ));
    }
}
