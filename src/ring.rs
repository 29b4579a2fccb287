//! One direction of the shared ring-buffer structure.
//!
//! Each ring is a power-of-two byte buffer with a head (write index) and a
//! tail (read index) living as 32-bit words in target RAM.  One slot is
//! permanently reserved so `head == tail` unambiguously means empty; usable
//! capacity is therefore `capacity - 1` bytes.  Ownership is split per
//! direction: on the TX ring the target advances head (and the overflow
//! counter), the host advances tail; on the RX ring it is reversed.
//!
//! Neither index is ever cached host-side.  Every drain or push re-reads
//! both words, because the firmware mutates its side asynchronously; the
//! final remote write of the owned index is the only side effect, so a
//! momentarily stale view costs at most one wasted round trip.
//!
//! Both [`RingLink::drain`] and [`RingLink::push`] transfer at most one
//! contiguous run per remote operation - up to the physical end of the
//! buffer, never the full logically-wrapped span.  This bounds the size of a
//! single RPC round trip; callers loop to pick up the remainder.  Preserve
//! this when tempted to "optimize": overflow detection and responsiveness
//! depend on the tight re-polling loop.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::MemIo;
use crate::{Error, Result};

/// Whether the host side of this ring is the Producer or Consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRole {
    Producer,
    Consumer,
}

fn consumer_only(role: RingRole) -> Result<()> {
    if role != RingRole::Consumer {
        Err(Error::InvalidArgument(
            "drain is a consumer-side operation".into(),
        ))
    } else {
        Ok(())
    }
}

fn producer_only(role: RingRole) -> Result<()> {
    if role != RingRole::Producer {
        Err(Error::InvalidArgument(
            "push is a producer-side operation".into(),
        ))
    } else {
        Ok(())
    }
}

/// Length of the contiguous run a consumer may read in one call.
///
/// `[tail, head)` when not wrapped, else only `[tail, capacity)` - the
/// post-wrap remainder is left for the next call.
pub(crate) fn drain_run(head: u32, tail: u32, capacity: u32) -> u32 {
    if head >= tail {
        head - tail
    } else {
        capacity - tail
    }
}

/// Contiguous free space a producer may fill at `head` in one call.
///
/// The reserved empty slot shows up two ways: as the permanent `- 1` when
/// the free region ends below `tail`, and as a special case when `tail == 0`
/// - writing all the way to the physical end would land `head` on `tail` and
/// make a full ring indistinguishable from an empty one.
pub(crate) fn push_run(head: u32, tail: u32, capacity: u32) -> u32 {
    if head >= tail {
        let mut space = capacity - head;
        if tail == 0 {
            space -= 1;
        }
        space
    } else {
        tail - head - 1
    }
}

/// Host-side handle to one ring direction.
///
/// Construction is via [`crate::link::BuffyLink`], which derives the
/// buffer/index addresses from the structure header.
pub struct RingLink<M: MemIo> {
    io: Arc<M>,
    role: RingRole,
    /// "tx" or "rx", for diagnostics.
    name: &'static str,
    /// Address of this ring's byte buffer in target RAM.
    buf_addr: u32,
    /// Power of two, from the structure header.
    capacity: u32,
    head_addr: u32,
    tail_addr: u32,
    overflow_addr: Option<u32>,
}

impl<M: MemIo> RingLink<M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        io: Arc<M>,
        role: RingRole,
        name: &'static str,
        buf_addr: u32,
        capacity: u32,
        head_addr: u32,
        tail_addr: u32,
        overflow_addr: Option<u32>,
    ) -> Self {
        Self {
            io,
            role,
            name,
            buf_addr,
            capacity,
            head_addr,
            tail_addr,
            overflow_addr,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Consumer: reads one contiguous run of available bytes, delivers them,
    /// and advances the remote tail.  Returns an empty vec when the ring is
    /// empty.  On wraparound only the run up to the physical buffer end is
    /// returned; call again for the remainder.
    pub fn drain(&self) -> Result<Vec<u8>> {
        consumer_only(self.role)?;

        let tail = self.io.read_word(self.tail_addr)?;
        let head = self.io.read_word(self.head_addr)?;
        self.check_indices(head, tail)?;
        if head == tail {
            return Ok(Vec::new());
        }

        let run = drain_run(head, tail, self.capacity);
        trace!(
            "{} ring: head {head} tail {tail}, draining {run} bytes",
            self.name
        );
        let bytes = self.io.read_bytes(self.buf_addr + tail, run as usize)?;
        let new_tail = (tail + bytes.len() as u32) % self.capacity;
        self.io.write_word(self.tail_addr, new_tail)?;
        Ok(bytes)
    }

    /// Producer: writes as much of `buf` as fits, advancing the remote head
    /// run by run.  A full ring aborts the remaining input: the number of
    /// bytes actually written is returned, and a short count means the rest
    /// was dropped.  That is the backpressure signal; there is no internal
    /// wait-for-space loop.
    pub fn push(&self, buf: &[u8]) -> Result<usize> {
        producer_only(self.role)?;

        let mut written = 0;
        let mut rest = buf;
        while !rest.is_empty() {
            let tail = self.io.read_word(self.tail_addr)?;
            let head = self.io.read_word(self.head_addr)?;
            self.check_indices(head, tail)?;

            let space = push_run(head, tail, self.capacity);
            if space == 0 {
                warn!(
                    "{} ring full, dropping {} remaining byte(s)",
                    self.name,
                    rest.len()
                );
                return Ok(written);
            }

            let n = (space as usize).min(rest.len());
            trace!(
                "{} ring: head {head} tail {tail}, writing {n} bytes",
                self.name
            );
            self.io.write_bytes(self.buf_addr + head, &rest[..n])?;
            let new_head = (head + n as u32) % self.capacity;
            self.io.write_word(self.head_addr, new_head)?;
            written += n;
            rest = &rest[n..];
        }
        Ok(written)
    }

    /// Current overflow counter value, for establishing a baseline.
    pub fn read_overflow(&self) -> Result<u32> {
        let addr = self.overflow_addr.ok_or_else(|| {
            Error::InvalidArgument("ring has no overflow counter".into())
        })?;
        self.io.read_word(addr)
    }

    /// Overflow events since `baseline`, which is updated to the current
    /// counter value.  The counter is monotonic modulo 2^32.
    pub fn overflow_delta(&self, baseline: &mut u32) -> Result<u32> {
        let counter = self.read_overflow()?;
        let delta = counter.wrapping_sub(*baseline);
        *baseline = counter;
        Ok(delta)
    }

    /// An index at or past capacity means the structure moved or we are
    /// reading garbage; bail out rather than stream junk.
    fn check_indices(&self, head: u32, tail: u32) -> Result<()> {
        if head >= self.capacity || tail >= self.capacity {
            Err(Error::Structure(format!(
                "{} ring index out of range (head: {head} tail: {tail}, capacity: {})",
                self.name, self.capacity
            )))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fake::FakeTargetRam;

    const BASE: u32 = 0x2000_0000;
    const CAP: u32 = 16;

    /// One ring of capacity 16 laid out at BASE: head word, tail word,
    /// overflow word, then the byte buffer.
    fn ring(role: RingRole) -> (Arc<FakeTargetRam>, RingLink<FakeTargetRam>) {
        let ram = Arc::new(FakeTargetRam::new(BASE, 64));
        let link = RingLink::new(
            Arc::clone(&ram),
            role,
            "test",
            BASE + 12,
            CAP,
            BASE,
            BASE + 4,
            Some(BASE + 8),
        );
        (ram, link)
    }

    #[test]
    fn drain_run_is_bounded_by_physical_end() {
        assert_eq!(drain_run(2, 14, 16), 2); // wrapped: only [14, 16)
        assert_eq!(drain_run(10, 4, 16), 6); // straight: [4, 10)
        assert_eq!(drain_run(5, 5, 16), 0);
    }

    #[test]
    fn push_run_reserves_the_sentinel_slot() {
        assert_eq!(push_run(0, 0, 16), 15); // tail at 0: one byte held back
        assert_eq!(push_run(4, 0, 16), 11);
        assert_eq!(push_run(4, 4, 16), 12); // to physical end, no special case
        assert_eq!(push_run(2, 10, 16), 7); // wrapped: tail - head - 1
        assert_eq!(push_run(9, 10, 16), 0); // full
    }

    #[test]
    fn drain_returns_one_wrapped_run_per_call() {
        let (ram, link) = ring(RingRole::Consumer);
        // tail 14, head 2: 4 logical bytes, split 2 + 2 across the wrap.
        ram.poke_word(BASE, 2);
        ram.poke_word(BASE + 4, 14);
        ram.poke_bytes(BASE + 12 + 14, &[0xAA, 0xBB]);
        ram.poke_bytes(BASE + 12, &[0xCC, 0xDD]);

        let first = link.drain().unwrap();
        assert_eq!(first, vec![0xAA, 0xBB]);
        assert_eq!(ram.peek_word(BASE + 4), 0); // tail wrapped to 0

        let second = link.drain().unwrap();
        assert_eq!(second, vec![0xCC, 0xDD]);
        assert_eq!(ram.peek_word(BASE + 4), 2);
    }

    #[test]
    fn drain_is_quiescent_without_new_data() {
        let (ram, link) = ring(RingRole::Consumer);
        ram.poke_word(BASE, 5);
        ram.poke_bytes(BASE + 12, b"hello");
        assert_eq!(link.drain().unwrap(), b"hello");
        // No remote head movement: the second drain finds nothing.
        assert!(link.drain().unwrap().is_empty());
    }

    #[test]
    fn push_fills_at_most_capacity_minus_one() {
        let (ram, link) = ring(RingRole::Producer);
        let written = link.push(&[0x55; 32]).unwrap();
        assert_eq!(written, 15);
        assert_eq!(ram.peek_word(BASE), 15); // head stopped at the sentinel
        assert_eq!(ram.peek_word(BASE + 4), 0);
        // Ring is now full; further pushes drop everything.
        assert_eq!(link.push(b"x").unwrap(), 0);
    }

    #[test]
    fn push_wraps_across_the_physical_end() {
        let (ram, link) = ring(RingRole::Producer);
        // head 14, tail 6: room for 2 bytes to the end, then 5 more.
        ram.poke_word(BASE, 14);
        ram.poke_word(BASE + 4, 6);
        let written = link.push(b"abcdefg").unwrap();
        assert_eq!(written, 7);
        assert_eq!(ram.peek_word(BASE), 5);
        let tail_part = ram.read_bytes(BASE + 12 + 14, 2).unwrap();
        let head_part = ram.read_bytes(BASE + 12, 5).unwrap();
        assert_eq!(tail_part, b"ab");
        assert_eq!(head_part, b"cdefg");
    }

    #[test]
    fn push_then_consume_leaves_no_backlog() {
        let (ram, link) = ring(RingRole::Producer);
        assert_eq!(link.push(b"ping").unwrap(), 4);
        // Simulated remote consumer catches up.
        ram.poke_word(BASE + 4, 4);
        let head = ram.peek_word(BASE);
        let tail = ram.peek_word(BASE + 4);
        assert_eq!(drain_run(head, tail, CAP), 0);
        // And the freed space is writable again.
        assert_eq!(link.push(&[0u8; 15]).unwrap(), 15);
    }

    #[test]
    fn out_of_range_indices_are_fatal() {
        let (ram, link) = ring(RingRole::Consumer);
        ram.poke_word(BASE, 900);
        assert!(matches!(link.drain(), Err(Error::Structure(_))));
    }

    #[test]
    fn role_guards_reject_the_wrong_direction() {
        let (_ram, consumer) = ring(RingRole::Consumer);
        let (_ram2, producer) = ring(RingRole::Producer);
        assert!(matches!(
            consumer.push(b"x"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(producer.drain(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn overflow_delta_updates_the_baseline() {
        let (ram, link) = ring(RingRole::Consumer);
        ram.poke_word(BASE + 8, 3);
        let mut baseline = link.read_overflow().unwrap();
        assert_eq!(link.overflow_delta(&mut baseline).unwrap(), 0);
        ram.poke_word(BASE + 8, 7);
        assert_eq!(link.overflow_delta(&mut baseline).unwrap(), 4);
        assert_eq!(link.overflow_delta(&mut baseline).unwrap(), 0);
        // Counter wrap is still a positive delta.
        ram.poke_word(BASE + 8, 1);
        baseline = u32::MAX;
        assert_eq!(link.overflow_delta(&mut baseline).unwrap(), 2);
    }
}
