//! Packet buffer layout for the encryption bridge
//!
//! Before a raw packet is handed to a tunnel backend, it must sit in a
//! buffer with reserved space before the payload (headroom, for
//! protocol/encryption headers) and after it (tailroom, for
//! authentication tags and padding). The encryption pipeline extends the
//! packet in place; without the reservations it fails outright rather
//! than reallocating.
//!
//! The bridge owns this layout: every packet crossing it is copied into
//! a freshly allocated `PacketBuffer`. Reusing the source buffer in
//! place is the failure mode this type exists to prevent.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Minimum bytes reserved before the payload.
///
/// Sized to the worst case across supported cipher suites rather than
/// tuned per suite; typical stacks consume 25-100 bytes of header.
pub const DEFAULT_HEADROOM: usize = 256;

/// Minimum bytes reserved after the payload.
pub const DEFAULT_TAILROOM: usize = 128;

/// Buffer layout violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// A prepend would run past the front of the buffer
    #[error("Headroom exhausted: need {need}, have {have}")]
    HeadroomExhausted { need: usize, have: usize },

    /// An append would run past the end of the buffer
    #[error("Tailroom exhausted: need {need}, have {have}")]
    TailroomExhausted { need: usize, have: usize },
}

/// A packet in a buffer with reserved headroom and tailroom
#[derive(Debug)]
pub struct PacketBuffer {
    data: BytesMut,
    offset: usize,
    len: usize,
}

impl PacketBuffer {
    /// Copy `payload` into a fresh buffer with the given reservations.
    ///
    /// The allocation is exactly `headroom + payload.len() + tailroom`
    /// bytes, with the payload starting at `headroom`.
    #[must_use]
    pub fn new(payload: &[u8], headroom: usize, tailroom: usize) -> Self {
        let mut data = BytesMut::zeroed(headroom + payload.len() + tailroom);
        data[headroom..headroom + payload.len()].copy_from_slice(payload);
        Self {
            data,
            offset: headroom,
            len: payload.len(),
        }
    }

    /// Copy `payload` into a fresh buffer with the default reservations
    #[must_use]
    pub fn with_default_layout(payload: &[u8]) -> Self {
        Self::new(payload, DEFAULT_HEADROOM, DEFAULT_TAILROOM)
    }

    /// Free bytes before the current packet start
    #[must_use]
    pub const fn headroom(&self) -> usize {
        self.offset
    }

    /// Free bytes after the current packet end
    #[must_use]
    pub fn tailroom(&self) -> usize {
        self.data.len() - self.offset - self.len
    }

    /// Current packet length (payload plus anything prepended/appended)
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if the packet region is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total allocated capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The current packet region
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// Mutable view of the current packet region
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..self.offset + self.len]
    }

    /// Grow the packet backwards into the headroom.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::HeadroomExhausted` if `header` does not fit.
    pub fn prepend(&mut self, header: &[u8]) -> Result<(), BufferError> {
        if header.len() > self.offset {
            return Err(BufferError::HeadroomExhausted {
                need: header.len(),
                have: self.offset,
            });
        }
        self.offset -= header.len();
        self.len += header.len();
        let end = self.offset + header.len();
        self.data[self.offset..end].copy_from_slice(header);
        Ok(())
    }

    /// Grow the packet forwards into the tailroom.
    ///
    /// # Errors
    ///
    /// Returns `BufferError::TailroomExhausted` if `trailer` does not fit.
    pub fn append(&mut self, trailer: &[u8]) -> Result<(), BufferError> {
        let tailroom = self.tailroom();
        if trailer.len() > tailroom {
            return Err(BufferError::TailroomExhausted {
                need: trailer.len(),
                have: tailroom,
            });
        }
        let start = self.offset + self.len;
        self.data[start..start + trailer.len()].copy_from_slice(trailer);
        self.len += trailer.len();
        Ok(())
    }

    /// Freeze and return the current packet region
    #[must_use]
    pub fn into_bytes(mut self) -> Bytes {
        let mut data = self.data.split_off(self.offset);
        data.truncate(self.len);
        data.freeze()
    }
}
