//! Outbound write-coalescing buffer
//!
//! Overdrive firmware accepts several whole frames in a single GATT
//! write-without-response. Enqueueable sends are staged here and flushed
//! as one write, amortising radio overhead; Drive firmware never uses
//! this and always writes through.

use crate::protocol::MAX_FRAME_SIZE;

/// Smallest possible frame: a size byte plus a message id.
const MIN_FRAME_SIZE: usize = 2;

/// Per-vehicle 20-byte staging area for enqueueable sends.
///
/// The buffer only ever holds whole frames in append order; it must be
/// empty whenever the vehicle is not connected.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: [u8; MAX_FRAME_SIZE],
    len: usize,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `n` more bytes fit without a flush.
    pub fn fits(&self, n: usize) -> bool {
        self.len + n <= MAX_FRAME_SIZE
    }

    /// Whether even a minimum frame still fits.
    pub fn has_room_for_min_frame(&self) -> bool {
        self.fits(MIN_FRAME_SIZE)
    }

    /// Append a whole frame. The caller must have flushed if it does
    /// not fit.
    pub fn append(&mut self, frame: &[u8]) {
        assert!(frame.len() <= MAX_FRAME_SIZE);
        assert!(self.fits(frame.len()), "message buffer overflow");
        self.buf[self.len..self.len + frame.len()].copy_from_slice(frame);
        self.len += frame.len();
    }

    /// Drain the staged bytes, returning them for a single write.
    pub fn take(&mut self) -> Option<([u8; MAX_FRAME_SIZE], usize)> {
        if self.len == 0 {
            return None;
        }
        let out = (self.buf, self.len);
        self.buf = [0u8; MAX_FRAME_SIZE];
        self.len = 0;
        Some(out)
    }

    /// Discard staged bytes without sending, used on teardown.
    pub fn clear(&mut self) {
        self.buf = [0u8; MAX_FRAME_SIZE];
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u8, payload_len: usize) -> Vec<u8> {
        let mut f = vec![(payload_len + 1) as u8, id];
        f.extend(std::iter::repeat(id).take(payload_len));
        f
    }

    #[test]
    fn test_append_and_take_preserves_order() {
        let mut buf = MessageBuffer::new();
        let a = frame(0x16, 0);
        let b = frame(0x24, 5);
        buf.append(&a);
        buf.append(&b);
        assert_eq!(buf.len(), 9);

        let (bytes, len) = buf.take().unwrap();
        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        assert_eq!(&bytes[..len], expected.as_slice());
        assert!(buf.is_empty());
        assert!(buf.take().is_none());
    }

    #[test]
    fn test_fits_accounts_for_capacity() {
        let mut buf = MessageBuffer::new();
        buf.append(&frame(0x24, 10)); // 12 bytes
        assert!(buf.fits(8));
        assert!(!buf.fits(9));
        assert!(buf.has_room_for_min_frame());

        buf.append(&frame(0x1d, 5)); // 7 more -> 19
        assert!(!buf.has_room_for_min_frame());
    }

    #[test]
    fn test_clear_empties_without_output() {
        let mut buf = MessageBuffer::new();
        buf.append(&frame(0x16, 0));
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.take().is_none());
    }

    #[test]
    #[should_panic(expected = "message buffer overflow")]
    fn test_overflowing_append_panics() {
        let mut buf = MessageBuffer::new();
        buf.append(&frame(0x25, 11)); // 13 bytes
        buf.append(&frame(0x25, 11)); // would be 26
    }
}
