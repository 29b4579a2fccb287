//! Discovery of the shared structure and the byte-moving loops on top of it.
//!
//! The target firmware places a fixed-layout structure somewhere in SRAM:
//!
//! | offset | word                     |
//! |--------|--------------------------|
//! | +0     | magic (`0xDD664662`)     |
//! | +4     | log2(TX capacity)        |
//! | +8     | log2(RX capacity)        |
//! | +12    | TX tail                  |
//! | +16    | TX head                  |
//! | +20    | RX tail                  |
//! | +24    | RX head                  |
//! | +28    | TX overflow counter      |
//! | +32    | TX byte buffer           |
//! | ...    | RX byte buffer (directly after TX) |
//!
//! [`BuffyLink::attach`] resolves the structure address (explicit override,
//! cached last-known location, or a word-by-word RAM scan), validates the
//! header once, and builds the two [`RingLink`]s.  Addresses and sizes are
//! immutable for the rest of the session.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::cache::{AddressCache, CacheStore};
use crate::io::MemIo;
use crate::ring::{RingLink, RingRole};
use crate::{Error, Result};

/// Magic value marking the start of the structure.
pub const BUFFY_MAGIC: u32 = 0xDD66_4662;

/// Default address where the RAM scan starts.
pub const DEFAULT_RAM_START: u32 = 0x1000_0000;
/// Default scan range in bytes.
pub const DEFAULT_RAM_SIZE: u32 = 128 * 1024;

const TX_TAIL_OFFSET: u32 = 12;
const TX_HEAD_OFFSET: u32 = 16;
const RX_TAIL_OFFSET: u32 = 20;
const RX_HEAD_OFFSET: u32 = 24;
const TX_OVERFLOW_OFFSET: u32 = 28;
const TX_BUF_OFFSET: u32 = 32;

/// Largest permitted size exponent: 2^16 = 64 KiB per ring.
const MAX_SIZE_LOG2: u32 = 16;

/// Shared liveness flag: the only cancellation primitive.
///
/// Any actor may cancel it; the watch loop and the readers observe it at
/// their next iteration.  Nothing is interrupted mid-flight - a blocked RPC
/// call completes or times out before its actor notices.
#[derive(Debug, Clone)]
pub struct LiveToken(Arc<AtomicBool>);

impl Default for LiveToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Where to look for the structure.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Known structure address; skips cache and scan when set.
    pub address: Option<u32>,
    pub ram_start: u32,
    pub ram_size: u32,
    /// Key for the address cache.
    pub target_name: String,
    /// Idle sleep between polls when the TX ring is empty.
    pub poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: None,
            ram_start: DEFAULT_RAM_START,
            ram_size: DEFAULT_RAM_SIZE,
            target_name: "default".into(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Host endpoint of the bidirectional link: TX consumer + RX producer over
/// one shared memory transport.
pub struct BuffyLink<M: MemIo> {
    address: u32,
    tx: RingLink<M>,
    rx: RingLink<M>,
    poll_interval: Duration,
}

impl<M: MemIo> BuffyLink<M> {
    /// Resolves the structure address, validates the header and builds the
    /// ring endpoints.
    ///
    /// Resolution order: explicit address from `config`, then the cached
    /// address for `target_name` (verified by one magic read - firmware
    /// relinks move the structure), then a 4-byte-step scan of
    /// `[ram_start, ram_start + ram_size)`.  A scan hit is recorded in the
    /// cache for next time.
    pub fn attach<S: CacheStore>(
        io: Arc<M>,
        config: &LinkConfig,
        cache: &mut AddressCache<S>,
    ) -> Result<Self> {
        let address = match config.address {
            Some(addr) => addr,
            None => Self::find_magic(&io, config, cache)?,
        };

        let header = io.read_words(address, 3)?;
        let (tx_size, rx_size) = parse_header(&header)?;
        info!(
            "buffy structure at {address:#010x}: tx buf {tx_size} bytes, rx buf {rx_size} bytes"
        );

        let tx = RingLink::new(
            Arc::clone(&io),
            RingRole::Consumer,
            "tx",
            address + TX_BUF_OFFSET,
            tx_size,
            address + TX_HEAD_OFFSET,
            address + TX_TAIL_OFFSET,
            Some(address + TX_OVERFLOW_OFFSET),
        );
        let rx = RingLink::new(
            io,
            RingRole::Producer,
            "rx",
            address + TX_BUF_OFFSET + tx_size,
            rx_size,
            address + RX_HEAD_OFFSET,
            address + RX_TAIL_OFFSET,
            None,
        );

        Ok(Self {
            address,
            tx,
            rx,
            poll_interval: config.poll_interval,
        })
    }

    /// Resolved structure address.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Looks for the magic word: cached location first, then a forward scan.
    fn find_magic<S: CacheStore>(
        io: &M,
        config: &LinkConfig,
        cache: &mut AddressCache<S>,
    ) -> Result<u32> {
        if let Some(previous) = cache.lookup(&config.target_name) {
            if io.read_word(previous)? == BUFFY_MAGIC {
                debug!("found magic at previous location {previous:#010x}");
                return Ok(previous);
            }
            debug!("cached address {previous:#010x} is stale, rescanning");
        }

        info!(
            "scanning {:#010x}..{:#010x} for magic word",
            config.ram_start,
            config.ram_start + config.ram_size
        );
        for offset in (0..config.ram_size).step_by(4) {
            let addr = config.ram_start + offset;
            if io.read_word(addr)? == BUFFY_MAGIC {
                debug!("found magic at {addr:#010x}");
                cache.store(&config.target_name, addr);
                return Ok(addr);
            }
        }
        Err(Error::NotFound)
    }

    /// Polls the TX ring until the token is cancelled, delivering every
    /// drained run to `sink`.
    ///
    /// A non-empty drain loops again immediately to catch up on backlog; an
    /// empty one samples the overflow counter and sleeps the poll interval.
    pub fn watch(&self, live: &LiveToken, mut sink: impl FnMut(&[u8])) -> Result<()> {
        let mut overflow_baseline = self.tx.read_overflow()?;

        while live.is_live() {
            let drained = self.tx.drain()?;
            if !drained.is_empty() {
                sink(&drained);
                continue;
            }

            let delta = self.tx.overflow_delta(&mut overflow_baseline)?;
            if delta > 0 {
                warn!("target tx side overflowed {delta} time(s), data was lost");
            }
            std::thread::sleep(self.poll_interval);
        }
        debug!("watch loop exiting");
        Ok(())
    }

    /// Injects bytes into the target's inbound ring.
    ///
    /// Safe to call concurrently from the console reader and the TCP bridge;
    /// the memory transport serializes remote operations.  Returns the byte
    /// count actually written - a short count means the ring filled up and
    /// the rest was dropped (already logged by the ring layer).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.rx.push(buf)
    }

    #[cfg(test)]
    pub(crate) fn tx(&self) -> &RingLink<M> {
        &self.tx
    }
}

/// Validates the 3-word header, returning (TX, RX) buffer sizes in bytes.
fn parse_header(header: &[u32]) -> Result<(u32, u32)> {
    let &[magic, tx_len_pow2, rx_len_pow2] = header else {
        return Err(Error::Structure(format!(
            "expected 3 header words, got {}",
            header.len()
        )));
    };
    if magic != BUFFY_MAGIC {
        return Err(Error::Structure(format!(
            "invalid magic in header: {magic:#010x}"
        )));
    }
    if tx_len_pow2 > MAX_SIZE_LOG2 || rx_len_pow2 > MAX_SIZE_LOG2 {
        return Err(Error::Structure(format!(
            "invalid buffer sizes (tx: {tx_len_pow2} bits rx: {rx_len_pow2} bits)"
        )));
    }
    Ok((1 << tx_len_pow2, 1 << rx_len_pow2))
}
