//! Transport layer
//!
//! The engine talks to the device through two small traits:
//! - [`PortOpener`] opens a device node with the configured line settings
//! - [`Transport`] is the open handle: raw reads, writes and close
//!
//! Implementations:
//! - [`serial::SerialPortOpener`] backed by the `serialport` crate
//! - [`mock::MockLink`] scriptable in-memory link for tests

pub mod mock;
pub mod serial;

pub use serial::{list_ports, PortInfo, SerialPortOpener, SerialTransport};

use std::io;

use crate::config::PortSettings;
use crate::error::SerialError;

/// An open device handle owned by exactly one engine
pub trait Transport: Send {
    /// Bytes currently buffered by the device, `None` when nothing is waiting
    fn read_available(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Write the whole buffer to the device
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Release the device; the handle is dropped afterwards
    fn close(&mut self) -> io::Result<()>;
}

/// Opens a [`Transport`] for a set of line settings
pub trait PortOpener: Send + Sync {
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn Transport>, SerialError>;
}

/// Whether an I/O error means the link itself is gone
pub fn is_link_fault(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotFound
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_fault_classification() {
        assert!(is_link_fault(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_link_fault(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_link_fault(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_link_fault(&io::Error::from(io::ErrorKind::InvalidInput)));
    }
}
