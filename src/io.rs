//! Trait seam for accessing target memory over a debug interface.
//!
//! The ring and link layers never talk to the RPC daemon directly; they go
//! through [`MemIo`].  In production the implementation is
//! [`crate::rpc::RpcChannel`], which routes every access through OpenOCD's
//! Tcl RPC server.  Tests substitute an in-memory fake so ring arithmetic
//! and structure discovery can be exercised without a daemon or a target.
//!
//! Methods take `&self`: one channel is shared by the watch loop, the
//! console reader and the TCP bridge, so implementations must provide their
//! own interior serialization (the RPC channel holds its session under a
//! mutex).
//!
//! # Address Space
//!
//! Addresses are absolute, as they appear in the target's memory map.  For
//! STM32F4 devices RAM typically starts at `0x20000000`; the implementation
//! translates them to whatever the underlying transport needs.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::Result;

/// Word and byte access to target memory.
pub trait MemIo: Send + Sync {
    /// Read one 32-bit word at `addr`.
    fn read_word(&self, addr: u32) -> Result<u32>;

    /// Write one 32-bit word at `addr`.
    fn write_word(&self, addr: u32, value: u32) -> Result<()>;

    /// Read `count` consecutive 32-bit words starting at `addr`.
    fn read_words(&self, addr: u32, count: usize) -> Result<Vec<u32>>;

    /// Read `len` bytes starting at `addr`.
    fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>>;

    /// Write `data` starting at `addr`.
    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory stand-in for a target's RAM.

    use std::sync::Mutex;

    use crate::{Error, Result};

    use super::MemIo;

    /// Fake target RAM backed by a plain byte vector.
    ///
    /// Little-endian, like every target this tool talks to.  Out-of-range
    /// accesses fail the same way a wild remote read would surface: as a
    /// protocol error.
    pub(crate) struct FakeTargetRam {
        base: u32,
        mem: Mutex<Vec<u8>>,
    }

    impl FakeTargetRam {
        pub(crate) fn new(base: u32, size: usize) -> Self {
            Self {
                base,
                mem: Mutex::new(vec![0; size]),
            }
        }

        pub(crate) fn poke_word(&self, addr: u32, value: u32) {
            self.poke_bytes(addr, &value.to_le_bytes());
        }

        pub(crate) fn poke_bytes(&self, addr: u32, data: &[u8]) {
            let off = (addr - self.base) as usize;
            let mut mem = self.mem.lock().unwrap();
            mem[off..off + data.len()].copy_from_slice(data);
        }

        pub(crate) fn peek_word(&self, addr: u32) -> u32 {
            let bytes = self.read_bytes(addr, 4).unwrap();
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        }

        fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>> {
            let size = self.mem.lock().unwrap().len();
            let start = addr
                .checked_sub(self.base)
                .ok_or_else(|| Self::out_of_range(addr))? as usize;
            let end = start + len;
            if end > size {
                return Err(Self::out_of_range(addr));
            }
            Ok(start..end)
        }

        fn out_of_range(addr: u32) -> Error {
            Error::Protocol(format!("fake ram access out of range at {addr:#010x}"))
        }
    }

    impl MemIo for FakeTargetRam {
        fn read_word(&self, addr: u32) -> Result<u32> {
            let bytes = self.read_bytes(addr, 4)?;
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }

        fn write_word(&self, addr: u32, value: u32) -> Result<()> {
            self.write_bytes(addr, &value.to_le_bytes())
        }

        fn read_words(&self, addr: u32, count: usize) -> Result<Vec<u32>> {
            (0..count)
                .map(|i| self.read_word(addr + (i as u32) * 4))
                .collect()
        }

        fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
            let range = self.range(addr, len)?;
            let mem = self.mem.lock().unwrap();
            Ok(mem[range].to_vec())
        }

        fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<()> {
            let range = self.range(addr, data.len())?;
            let mut mem = self.mem.lock().unwrap();
            mem[range].copy_from_slice(data);
            Ok(())
        }
    }
}
