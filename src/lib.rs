//! Host-side link to a `buffy` debug console running on a microcontroller,
//! carried entirely over a debug probe (JTAG/SWD) and OpenOCD's Tcl RPC
//! server.  No UART or network interface is required on the target.
//!
//! The target firmware keeps a fixed-layout structure in SRAM: a magic word,
//! two ring-buffer size exponents, head/tail/overflow words, and the two ring
//! byte buffers themselves.  This crate locates that structure, then moves
//! bytes both ways:
//! - **TX ring** (target → host): the target produces bytes, the host polls
//!   and drains them to stdout or a bridge callback.
//! - **RX ring** (host → target): console keystrokes or bridged TCP data are
//!   injected into the target's inbound ring.
//!
//! Both rings are single-producer/single-consumer.  Each side owns exactly
//! one index per ring, so remotely-mediated accesses need no target-side
//! locking; the host re-reads head and tail on every operation instead of
//! caching them, because the firmware mutates its words asynchronously.
//!
//! ## Modules
//!
//! - [`rpc`] - [`rpc::RpcChannel`], the OpenOCD Tcl RPC client: 0x1A-framed
//!   commands over TCP, one-time preparation commands per connection,
//!   chunked array reads/writes, retries with reconnection
//! - [`io`] - [`io::MemIo`], the trait seam for target memory access;
//!   implemented by `RpcChannel`, or by an in-memory fake in tests
//! - [`ring`] - [`ring::RingLink`], one ring direction: drain/push with
//!   wraparound arithmetic and full/empty disambiguation
//! - [`link`] - [`link::BuffyLink`], structure discovery, header parsing,
//!   and the watch/write entry points the actors drive
//! - [`cache`] - [`cache::AddressCache`], last-known structure address per
//!   target name, persisted between runs to skip the RAM scan
//! - [`bridge`] - console reader and local TCP bridge actors feeding
//!   [`link::BuffyLink::write`]
//!
//! ## Concurrency model
//!
//! Three threads of control share one [`rpc::RpcChannel`]: the watch loop,
//! the console reader, and (optionally) the TCP bridge.  The channel
//! serializes every command/response exchange under a single critical
//! section - the wire protocol carries no request IDs, so concurrent senders
//! would corrupt each other's frames.  A shared [`link::LiveToken`] is the
//! only cancellation primitive: any actor may cancel it, and the others
//! notice at their next poll or read.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use thiserror::Error;

pub mod bridge;
pub mod cache;
pub mod io;
pub mod link;
pub mod ring;
pub mod rpc;

/// Link errors.
///
/// [`Error::Transport`] and [`Error::Protocol`] are retryable - both usually
/// mean the RPC connection is stale.  The rest are fatal: a bad structure
/// header or a failed scan will not get better by retrying.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket closed, connect failure, or a read that exceeded the timeout.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed or mismatched RPC response.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The resolved structure address holds garbage, or the header is
    /// incompatible with this client.
    #[error("structure: {0}")]
    Structure(String),

    /// Magic word not found within the scan range.
    #[error("magic word not found in scan range")]
    NotFound,

    /// Caller error, not retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Whether the retry policy should re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_))
    }
}

/// Type to represent the result of a link operation
pub type Result<T> = core::result::Result<T, Error>;

/// Parses an unsigned 32-bit integer, accepting a `0x` hex prefix.
///
/// Used for CLI address flags, cached address strings and RPC response
/// address fields, all of which mix decimal and hex forms.
pub fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_u32_accepts_hex_and_decimal() {
        assert_eq!(parse_u32("0x20000000"), Some(0x2000_0000));
        assert_eq!(parse_u32("0X10"), Some(16));
        assert_eq!(parse_u32("4096"), Some(4096));
        assert_eq!(parse_u32(" 0xdd664662 "), Some(0xDD66_4662));
        assert_eq!(parse_u32("flux"), None);
        assert_eq!(parse_u32("0x"), None);
    }

    #[test]
    fn transport_and_protocol_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        assert!(Error::Transport(io).is_retryable());
        assert!(Error::Protocol("odd token count".into()).is_retryable());
        assert!(!Error::Structure("bad magic".into()).is_retryable());
        assert!(!Error::NotFound.is_retryable());
        assert!(!Error::InvalidArgument("empty".into()).is_retryable());
    }
}
