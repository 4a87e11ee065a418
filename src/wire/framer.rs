//! Stream framing for byte-oriented transports.
//!
//! A [`StreamFramer`] accumulates bytes as they arrive and yields complete
//! frames. It keeps no protocol state beyond the unconsumed tail.

use std::collections::VecDeque;
use std::marker::PhantomData;

use super::lbs::LbsMessage;
use super::mcs::McsMessage;

/// A frame that can be cut from the front of a byte stream.
pub trait Frame: Sized {
    /// Decode one frame from the start of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupies, or `None`
    /// when `buf` does not yet hold a complete frame. Never panics on
    /// truncated input.
    fn try_decode(buf: &[u8]) -> Option<(Self, usize)>;
}

/// Byte accumulator yielding complete frames of type `F`.
#[derive(Debug)]
pub struct StreamFramer<F: Frame> {
    buf: VecDeque<u8>,
    _frame: PhantomData<fn() -> F>,
}

impl<F: Frame> Default for StreamFramer<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Frame> StreamFramer<F> {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self {
            buf: VecDeque::new(),
            _frame: PhantomData,
        }
    }

    /// Append received bytes.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend(data);
    }

    /// Extract the next complete frame, consuming its bytes.
    pub fn try_extract_frame(&mut self) -> Option<F> {
        let (frame, used) = F::try_decode(self.buf.make_contiguous())?;
        self.buf.drain(..used);
        Some(frame)
    }

    /// Extract every complete frame.
    pub fn drain_frames(&mut self) -> Vec<F> {
        std::iter::from_fn(|| self.try_extract_frame()).collect()
    }

    /// Bytes waiting for a complete frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Framer for the lobby stream.
pub type LbsFramer = StreamFramer<LbsMessage>;

/// Framer for the match stream.
pub type McsFramer = StreamFramer<McsMessage>;
