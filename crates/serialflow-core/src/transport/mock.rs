//! Mock serial link for testing
//!
//! A [`MockLink`] is a scriptable stand-in for a device: bytes can be
//! injected for the engine to read, writes are recorded, and canned
//! responses can be produced for matching writes. Faults (failed opens,
//! read/write errors, a yanked cable) are switched on from the test.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{PortOpener, Transport};
use crate::config::PortSettings;
use crate::error::SerialError;

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct MockState {
    /// Bursts waiting to be read; each read returns one burst
    incoming: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    /// Request prefix -> response, first match wins
    responses: Vec<(Vec<u8>, Vec<u8>)>,
    responder: Option<Responder>,
    fail_reads: bool,
    write_fault: Option<io::ErrorKind>,
    failing_opens: u32,
    open_error: Option<SerialError>,
    open_count: u32,
    close_count: u32,
    /// Bumped on every successful open
    generation: u64,
    /// Handles from this generation or older are dead
    severed: Option<u64>,
    last_settings: Option<PortSettings>,
}

impl MockState {
    fn respond(&self, data: &[u8]) -> Option<Vec<u8>> {
        if let Some(responder) = &self.responder {
            if let Some(resp) = responder(data) {
                return Some(resp);
            }
        }
        self.responses
            .iter()
            .find(|(req, _)| data.starts_with(req))
            .map(|(_, resp)| resp.clone())
    }

    fn is_severed(&self, generation: u64) -> bool {
        self.severed.is_some_and(|s| generation <= s)
    }
}

/// Shared handle to a simulated device
#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opener that hands out transports on this link
    pub fn opener(&self) -> Arc<dyn PortOpener> {
        Arc::new(MockOpener { link: self.clone() })
    }

    /// A transport on this link, bypassing the opener bookkeeping
    pub fn transport(&self) -> MockTransport {
        let generation = self.state.lock().generation;
        MockTransport {
            link: self.clone(),
            generation,
        }
    }

    /// Queue bytes for the engine to read as one burst
    pub fn inject(&self, data: impl Into<Vec<u8>>) {
        self.state.lock().incoming.push_back(data.into());
    }

    /// Reply with `response` whenever a write starts with `request`
    pub fn add_response(&self, request: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .responses
            .push((request.into(), response.into()));
    }

    /// Compute replies from writes; consulted before the canned responses
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Every payload written so far, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().written.len()
    }

    /// Make every read fail with `BrokenPipe`
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Make every write fail with `kind`; `None` restores normal writes
    pub fn set_write_fault(&self, kind: Option<io::ErrorKind>) {
        self.state.lock().write_fault = kind;
    }

    /// The next `count` opens fail with `PortOpenFailed`
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().failing_opens = count;
    }

    /// Every open fails with `error` until cleared
    pub fn set_open_error(&self, error: Option<SerialError>) {
        self.state.lock().open_error = error;
    }

    /// Kill all currently open handles, as if the cable was pulled
    ///
    /// Handles opened afterwards work normally.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        state.severed = Some(state.generation);
        state.incoming.clear();
    }

    /// Opens attempted, successful or not
    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().close_count
    }

    /// Settings passed to the most recent open
    pub fn last_settings(&self) -> Option<PortSettings> {
        self.state.lock().last_settings.clone()
    }
}

/// [`PortOpener`] for a [`MockLink`]
pub struct MockOpener {
    link: MockLink,
}

impl PortOpener for MockOpener {
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn Transport>, SerialError> {
        let mut state = self.link.state.lock();
        state.open_count += 1;
        state.last_settings = Some(settings.clone());

        if let Some(err) = &state.open_error {
            return Err(err.clone());
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            debug!(path = %settings.device_path, "mock open failure");
            return Err(SerialError::PortOpenFailed {
                path: settings.device_path.clone(),
                reason: "mock open failure".to_string(),
            });
        }

        state.generation += 1;
        Ok(Box::new(MockTransport {
            link: self.link.clone(),
            generation: state.generation,
        }))
    }
}

/// Open handle on a [`MockLink`]
pub struct MockTransport {
    link: MockLink,
    generation: u64,
}

impl Transport for MockTransport {
    fn read_available(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut state = self.link.state.lock();
        if state.fail_reads || state.is_severed(self.generation) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock link down"));
        }
        Ok(state.incoming.pop_front())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.link.state.lock();
        if state.is_severed(self.generation) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock link down"));
        }
        if let Some(kind) = state.write_fault {
            return Err(io::Error::new(kind, "mock write failure"));
        }
        state.written.push(data.to_vec());
        if let Some(resp) = state.respond(data) {
            state.incoming.push_back(resp);
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.link.state.lock().close_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_canned_response_follows_write() {
        let link = MockLink::new();
        link.add_response(vec![0x10], vec![0x50, 0x01]);
        let mut t = link.transport();

        t.write(&[0x10, 0x01]).unwrap();
        t.write(&[0x22]).unwrap();
        assert_eq!(t.read_available().unwrap(), Some(vec![0x50, 0x01]));
        assert_eq!(t.read_available().unwrap(), None);
        assert_eq!(link.written(), vec![vec![0x10, 0x01], vec![0x22]]);
    }

    #[test]
    fn test_responder_takes_precedence() {
        let link = MockLink::new();
        link.add_response(vec![0x10], vec![0x00]);
        link.set_responder(|data: &[u8]| Some(vec![data[0].wrapping_add(0x40)]));
        let mut t = link.transport();

        t.write(&[0x10]).unwrap();
        assert_eq!(t.read_available().unwrap(), Some(vec![0x50]));
    }

    #[test]
    fn test_failing_opens_then_success() {
        let link = MockLink::new();
        let opener = link.opener();
        link.fail_next_opens(2);

        let settings = PortSettings::default();
        assert!(opener.open(&settings).is_err());
        assert!(opener.open(&settings).is_err());
        assert!(opener.open(&settings).is_ok());
        assert_eq!(link.open_count(), 3);
    }

    #[test]
    fn test_sever_kills_only_existing_handles() {
        let link = MockLink::new();
        let opener = link.opener();
        let settings = PortSettings::default();

        let mut old = opener.open(&settings).unwrap();
        link.sever();
        assert!(old.read_available().is_err());
        assert!(old.write(&[1]).is_err());

        let mut fresh = opener.open(&settings).unwrap();
        assert_eq!(fresh.read_available().unwrap(), None);
        fresh.write(&[1]).unwrap();
    }

    #[test]
    fn test_write_fault() {
        let link = MockLink::new();
        let mut t = link.transport();
        link.set_write_fault(Some(io::ErrorKind::TimedOut));
        let err = t.write(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(link.write_count(), 0);
    }
}
