//! A command channel: one ring plus the record framing discipline.
//!
//! Records are never split across the physical end of storage. When a
//! reservation does not fit in the bytes remaining before the end,
//! `require_space` first publishes a padding record covering exactly that
//! remainder (a header-only NOP when one header's worth remains, a SKIP with
//! an explicit size otherwise) and restarts the reservation at offset zero. The drain loop consumes padding records like any other, so the
//! consumer needs no out-of-band wrap signal.

use bytemuck::bytes_of;
use sirocco_ring::RingBuffer;

use crate::op::{NopOp, Opcode, SkipOp, RECORD_ALIGN};

pub(crate) struct Channel {
    ring: RingBuffer,
}

impl Channel {
    pub(crate) fn new(capacity_bytes: usize) -> Self {
        Self {
            ring: RingBuffer::with_capacity(capacity_bytes),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Reserve `len` contiguous writable bytes, spinning while the consumer
    /// catches up. Producer side only; the returned span must be filled and
    /// [`submit`](Self::submit)ted before the next reservation.
    pub(crate) fn require_space(&self, len: usize) -> &mut [u8] {
        assert!(len % RECORD_ALIGN == 0, "unaligned reservation: {len}");
        assert!(
            len <= self.ring.capacity_bytes(),
            "record of {len} bytes cannot fit a {} byte channel",
            self.ring.capacity_bytes()
        );

        let remainder = self.ring.contiguous_writable();
        if len > remainder {
            self.ring.wait_free(remainder);
            // SAFETY: single producer; `remainder` bytes are free and
            // contiguous by construction.
            let pad = unsafe { self.ring.writable_slice(remainder) };
            if remainder == core::mem::size_of::<NopOp>() {
                pad.copy_from_slice(bytes_of(&NopOp {
                    opcode: Opcode::Nop as u32,
                }));
            } else {
                let skip = SkipOp {
                    opcode: Opcode::Skip as u32,
                    size: remainder as u32,
                };
                pad[..core::mem::size_of::<SkipOp>()].copy_from_slice(bytes_of(&skip));
            }
            self.ring.publish(remainder);
        }

        self.ring.wait_free(len);
        // SAFETY: single producer; the padding above guarantees the span is
        // contiguous, and `wait_free` that it is unoccupied.
        unsafe { self.ring.writable_slice(len) }
    }

    /// Publish the most recent reservation.
    pub(crate) fn submit(&self, len: usize) {
        self.ring.publish(len);
    }

    /// The contiguous published bytes at the read cursor, or `None` when the
    /// channel is empty. The producer's framing guarantees the span starts
    /// with a whole record. Consumer side only.
    pub(crate) fn peek(&self) -> Option<&[u8]> {
        let readable = self.ring.readable_bytes();
        if readable == 0 {
            return None;
        }
        let contiguous = readable.min(self.ring.capacity_bytes() - self.ring.read_index());
        // SAFETY: single consumer; `contiguous` bytes are published and do
        // not cross the physical end.
        Some(unsafe { self.ring.readable_slice(contiguous) })
    }

    /// Return `len` consumed bytes to the producer.
    pub(crate) fn release(&self, len: usize) {
        self.ring.release(len);
    }

    #[cfg(test)]
    pub(crate) fn ring(&self) -> &RingBuffer {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::pod_read_unaligned;

    fn queue(chan: &Channel, bytes: &[u8]) {
        let buf = chan.require_space(bytes.len());
        buf.copy_from_slice(bytes);
        chan.submit(bytes.len());
    }

    /// Drain one record the way the worker does, returning (opcode, size).
    fn drain_one(chan: &Channel) -> Option<(Opcode, usize)> {
        let bytes = chan.peek()?;
        let raw: u32 = pod_read_unaligned(&bytes[..4]);
        let opcode = Opcode::from_u32(raw).expect("valid opcode");
        let size = match opcode {
            Opcode::Nop => core::mem::size_of::<NopOp>(),
            Opcode::Skip => {
                let op: SkipOp = pod_read_unaligned(&bytes[..core::mem::size_of::<SkipOp>()]);
                op.size as usize
            }
            _ => bytes.len(),
        };
        chan.release(size);
        Some((opcode, size))
    }

    #[test]
    fn fixed_records_round_trip_to_empty() {
        let chan = Channel::new(256);
        let record = [0x24u8, 0, 0, 0, 7, 0, 0, 0, 1, 0, 0, 0]; // SetRenderState-shaped, 12 bytes
        for _ in 0..5 {
            queue(&chan, &record);
        }
        let mut drained = 0;
        while let Some(bytes) = chan.peek() {
            assert_eq!(&bytes[..12], &record);
            chan.release(12);
            drained += 1;
        }
        assert_eq!(drained, 5);
        assert!(chan.ring().is_empty());
        assert_eq!(chan.ring().read_index(), 5 * 12 % 256);
    }

    #[test]
    fn wrap_inserts_exactly_one_skip_record() {
        let chan = Channel::new(64);
        // Leave 16 bytes before the physical end...
        queue(&chan, &[0u8; 48][..]);
        while drain_one(&chan).is_some() {}
        // ...then reserve 24: a single SKIP must cover the 16-byte tail and
        // the record must land at offset 0.
        let buf = chan.require_space(24);
        buf.fill(0);
        buf[0] = Opcode::Stop as u8;
        chan.submit(24);

        let (opcode, size) = drain_one(&chan).unwrap();
        assert_eq!(opcode, Opcode::Skip);
        assert_eq!(size, 16);
        assert_eq!(chan.ring().read_index(), 0);

        let (opcode, size) = drain_one(&chan).unwrap();
        assert_eq!(opcode, Opcode::Stop);
        assert_eq!(size, 24);
        assert!(chan.ring().is_empty());
    }

    #[test]
    fn wrap_with_single_header_remaining_uses_nop() {
        let chan = Channel::new(64);
        // Leave exactly one header (4 bytes) before the physical end.
        queue(&chan, &[0u8; 60][..]);
        while drain_one(&chan).is_some() {}
        let buf = chan.require_space(8);
        buf.fill(0);
        buf[0] = Opcode::Skip as u8;
        buf[4] = 8;
        chan.submit(8);

        let (opcode, size) = drain_one(&chan).unwrap();
        assert_eq!(opcode, Opcode::Nop);
        assert_eq!(size, 4);
        assert_eq!(chan.ring().read_index(), 0);
        assert_eq!(drain_one(&chan).unwrap(), (Opcode::Skip, 8));
    }

    #[test]
    fn exact_fit_at_end_needs_no_padding() {
        let chan = Channel::new(64);
        queue(&chan, &[0u8; 48][..]);
        while drain_one(&chan).is_some() {}
        // 16 bytes remain and 16 are requested: no padding record.
        let buf = chan.require_space(16);
        buf.fill(0);
        chan.submit(16);
        assert_eq!(drain_one(&chan).unwrap(), (Opcode::Nop, 4));
        assert_eq!(chan.ring().read_index(), 52);
    }
}
