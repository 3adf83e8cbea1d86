//! Frame boundary strategies
//!
//! A serial link delivers an unframed byte stream; a [`Framer`] turns it back
//! into discrete frames. The read loop calls [`Framer::next_frame`] once per
//! tick and expects at most one frame back.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::transport::Transport;

/// Default frame size for [`FixedLengthFramer`]
pub const DEFAULT_FRAME_LENGTH: usize = 17;

/// Builds the framer an engine reads through
pub type FramerFactory = Arc<dyn Fn() -> Box<dyn Framer> + Send + Sync>;

/// Recovers message boundaries from the transport's byte stream
pub trait Framer: Send {
    /// Produce the next frame, or `None` if no complete frame is available yet
    fn next_frame(&mut self, source: &mut dyn Transport) -> io::Result<Option<Vec<u8>>>;

    /// Drop any partially accumulated state; called whenever the device is reopened
    fn reset(&mut self) {}
}

/// Built-in framing strategies selectable from settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Framing {
    /// Everything currently buffered is one frame
    #[default]
    Greedy,
    /// Frames are exactly `length` bytes
    FixedLength { length: usize },
}

impl Framing {
    pub fn build(&self) -> Box<dyn Framer> {
        match *self {
            Framing::Greedy => Box::new(GreedyFramer),
            Framing::FixedLength { length } => Box::new(FixedLengthFramer::new(length)),
        }
    }
}

/// Returns whatever the transport has buffered as a single frame
///
/// Fragmented or coalesced frames are left to the match rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyFramer;

impl Framer for GreedyFramer {
    fn next_frame(&mut self, source: &mut dyn Transport) -> io::Result<Option<Vec<u8>>> {
        Ok(source.read_available()?.filter(|bytes| !bytes.is_empty()))
    }
}

/// Cuts the stream into frames of a fixed size
///
/// Partial frames are kept across ticks, so a frame split over several
/// reads is reassembled. Surplus bytes stay buffered for the next call.
#[derive(Debug)]
pub struct FixedLengthFramer {
    length: usize,
    buffer: Vec<u8>,
}

impl Default for FixedLengthFramer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_LENGTH)
    }
}

impl FixedLengthFramer {
    pub fn new(length: usize) -> Self {
        let length = length.max(1);
        Self {
            length,
            buffer: Vec::with_capacity(length),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.buffer.len() >= self.length {
            Some(self.buffer.drain(..self.length).collect())
        } else {
            None
        }
    }
}

impl Framer for FixedLengthFramer {
    fn next_frame(&mut self, source: &mut dyn Transport) -> io::Result<Option<Vec<u8>>> {
        if let Some(frame) = self.take_frame() {
            return Ok(Some(frame));
        }
        if let Some(bytes) = source.read_available()? {
            self.buffer.extend_from_slice(&bytes);
        }
        Ok(self.take_frame())
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}
