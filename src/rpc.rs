//! Client for OpenOCD's Tcl RPC server.
//!
//! OpenOCD exposes a plain-TCP remote-scripting port (default 6666).  A
//! request is ASCII command text followed by a single `0x1A` byte; the
//! response is everything up to the next `0x1A`.  The socket is a raw byte
//! stream, so the terminator can arrive split across reads or glued to the
//! start of the next response - [`Session`] keeps any bytes read past a
//! terminator for the following exchange.
//!
//! The protocol carries no request IDs.  One mutex therefore guards the
//! entire send/receive/chunk sequence of every public operation; concurrent
//! callers from the watch, console and bridge threads are serialized here.
//!
//! Memory access is built from the Tcl primitives: `ocd_mdw`/`ocd_mww` for
//! single words, and `mem2array`/`array2mem` through a shared intermediate
//! array variable for blocks.  Block reads are chunked because the
//! interpreter limits how much moves through one array variable at a time,
//! and the echoed `(index, value)` pairs must be re-sorted - Tcl arrays do
//! not iterate in index order.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::io::{ErrorKind, Read, Write as _};
use std::net::TcpStream;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use regex::Regex;

use crate::io::MemIo;
use crate::{Error, Result};

/// Default TCP port OpenOCD's Tcl RPC server listens on.
pub const DEFAULT_PORT: u16 = 6666;

/// Input and output frame terminator.
const CMD_TERMINATOR: u8 = 0x1A;

/// Maximum elements moved through the intermediate array variable per
/// sub-request.
const READ_CHUNK_SIZE: usize = 4096;

/// Short read timeout used when draining stray bytes after a failure.
const FLUSH_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Upper bound on flush reads, so a daemon spewing output cannot wedge the
/// retry path.
const FLUSH_MAX_READS: usize = 64;

/// Memory access width for block operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::Byte => 8,
            Width::Half => 16,
            Width::Word => 32,
        }
    }

    pub fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }
}

/// RPC channel configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// TCP port to connect to on localhost.
    pub port: u16,
    /// Commands executed once per connection, before normal traffic and
    /// again after any reconnect.
    pub prepare_commands: Vec<String>,
    /// Attempts per operation.  1 means no retry.
    pub tries: u32,
    /// Time to wait for a response before declaring the read dead.
    pub timeout: Duration,
    /// Pause between attempts.
    pub backoff: Duration,
    /// Tcl variable name for intermediate block data.  Use distinct names if
    /// several clients share one daemon.
    pub array_var: String,
    /// Response lines matching any of these are dropped, e.g. probe banners
    /// interleaved with command output.
    pub ignore_patterns: Vec<Regex>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            prepare_commands: Vec::new(),
            tries: 1,
            timeout: Duration::from_secs(2),
            backoff: Duration::from_secs(1),
            array_var: "_rpc_array".into(),
            ignore_patterns: Vec::new(),
        }
    }
}

/// Retry policy: a fixed number of attempts with a pause and a caller-chosen
/// recovery step between them.
///
/// Kept separate from the channel so the policy is testable against a plain
/// failing closure, without a socket in the picture.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub tries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Runs `attempt` up to `tries` times.  `recover` is invoked between
    /// attempts, after the backoff, for retryable errors only.  The last
    /// error propagates unchanged.
    pub(crate) fn run<C, T>(
        &self,
        ctx: &mut C,
        mut attempt: impl FnMut(&mut C) -> Result<T>,
        mut recover: impl FnMut(&mut C, &Error),
    ) -> Result<T> {
        let mut left = self.tries.max(1);
        loop {
            match attempt(ctx) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && left > 1 => {
                    left -= 1;
                    warn!(
                        "rpc operation failed ({e}); waiting {:?} before retrying {left} more time(s)",
                        self.backoff
                    );
                    thread::sleep(self.backoff);
                    recover(ctx, &e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Per-connection state: the socket, bytes read past the last terminator,
/// and whether preparation commands have run on this connection.
struct Session {
    stream: TcpStream,
    leftover: Vec<u8>,
    primed: bool,
}

impl Session {
    fn connect(port: u16, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(("localhost", port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        Ok(Self {
            stream,
            leftover: Vec::new(),
            primed: false,
        })
    }

    /// Sends one terminated command and reads bytes up to the next
    /// terminator.  Bytes past it are saved for the next exchange.
    fn exchange(&mut self, cmd: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut frame = Vec::with_capacity(cmd.len() + 1);
        frame.extend_from_slice(cmd.as_bytes());
        frame.push(CMD_TERMINATOR);
        self.stream.write_all(&frame)?;

        let mut received = Vec::new();
        loop {
            let chunk = if self.leftover.is_empty() {
                self.read_some()?
            } else {
                std::mem::take(&mut self.leftover)
            };
            if let Some(pos) = chunk.iter().position(|&b| b == CMD_TERMINATOR) {
                received.extend_from_slice(&chunk[..pos]);
                self.leftover = chunk[pos + 1..].to_vec();
                break;
            }
            received.extend_from_slice(&chunk);
        }
        Ok(received)
    }

    fn read_some(&mut self) -> Result<Vec<u8>> {
        let mut buf = [0u8; 1024];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(Error::Transport(std::io::Error::new(
                ErrorKind::ConnectionAborted,
                "socket closed by daemon",
            ))),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Err(Error::Transport(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "socket read timeout",
                )))
            }
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Best-effort drain of stray bytes still arriving after a failed
    /// exchange, so a late response cannot be mistaken for the next one.
    fn flush_stray(&mut self) {
        self.leftover.clear();
        if self.stream.set_read_timeout(Some(FLUSH_READ_TIMEOUT)).is_err() {
            return;
        }
        let mut buf = [0u8; 1024];
        let mut flushed = 0usize;
        for _ in 0..FLUSH_MAX_READS {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => flushed += n,
            }
        }
        if flushed > 0 {
            debug!("flushed {flushed} stray bytes");
        }
    }

    /// Pre-retry recovery.  Always flushes and drops priming; transport
    /// failures additionally replace the connection, since the old socket is
    /// likely dead.
    fn recover(&mut self, err: &Error, port: u16, timeout: Duration) {
        self.primed = false;
        self.flush_stray();
        if matches!(err, Error::Transport(_)) {
            match Session::connect(port, timeout) {
                Ok(fresh) => {
                    *self = fresh;
                    debug!("reconnected to RPC daemon on port {port}");
                }
                Err(e) => warn!("reconnect failed: {e}"),
            }
        }
    }
}

/// Channel to one OpenOCD Tcl RPC server.
///
/// All public operations serialize on the internal session mutex and honor
/// the configured retry policy; see [`RpcConfig`].  Shared across actor
/// threads behind an `Arc`.
pub struct RpcChannel {
    config: RpcConfig,
    retry: RetryPolicy,
    session: Mutex<Session>,
}

impl RpcChannel {
    /// Connects to the daemon on localhost.  Preparation commands are not
    /// sent yet; they run lazily before the first real command.
    pub fn connect(config: RpcConfig) -> Result<Self> {
        let session = Session::connect(config.port, config.timeout)?;
        info!("connected to RPC daemon on port {}", config.port);
        let retry = RetryPolicy {
            tries: config.tries.max(1),
            backoff: config.backoff,
        };
        Ok(Self {
            config,
            retry,
            session: Mutex::new(session),
        })
    }

    /// Sends a raw command and returns the response bytes.
    ///
    /// Primes the connection first if needed.  Unlike the memory operations
    /// this is not retried; callers wanting retry semantics use those.
    pub fn send_command(&self, cmd: &str) -> Result<Vec<u8>> {
        let mut s = self.lock();
        self.command(&mut s, cmd)
    }

    /// As [`Self::send_command`], with an explicit response timeout for this
    /// exchange (preparation commands still use the configured default).
    pub fn send_command_with_timeout(&self, cmd: &str, timeout: Duration) -> Result<Vec<u8>> {
        let mut s = self.lock();
        self.prime(&mut s)?;
        trace!(">{cmd}");
        let out = s.exchange(cmd, timeout)?;
        Ok(self.filter_ignored(out))
    }

    /// Reads one 32-bit word.
    pub fn read_word(&self, address: u32) -> Result<u32> {
        let mut s = self.lock();
        self.run_op(&mut s, |ch, s| {
            let out = ch.command(s, &format!("ocd_mdw 0x{address:x}"))?;
            parse_word_response(&out, address)
        })
    }

    /// Writes one 32-bit word.
    pub fn write_word(&self, address: u32, value: u32) -> Result<()> {
        let mut s = self.lock();
        self.run_op(&mut s, |ch, s| {
            ch.command(s, &format!("ocd_mww 0x{address:x} 0x{value:x}"))
                .map(|_| ())
        })
    }

    /// Reads `count` elements of the given width starting at `address`.
    ///
    /// Issued as sub-requests of at most [`READ_CHUNK_SIZE`] elements, each
    /// retried independently.  Returned values are in ascending address
    /// order regardless of how the interpreter echoed them.
    pub fn read_memory(&self, address: u32, count: usize, width: Width) -> Result<Vec<u32>> {
        let mut s = self.lock();
        let mut out = Vec::with_capacity(count);
        let mut addr = address;
        let mut left = count;
        while left > 0 {
            let this_count = left.min(READ_CHUNK_SIZE);
            let chunk =
                self.run_op(&mut s, |ch, s| ch.read_chunk(s, addr, this_count, width))?;
            out.extend(chunk);
            left -= this_count;
            addr += (this_count * width.bytes()) as u32;
        }
        Ok(out)
    }

    /// Writes `values` with the given width starting at `address`.
    pub fn write_memory(&self, address: u32, values: &[u32], width: Width) -> Result<()> {
        if values.is_empty() {
            return Err(Error::InvalidArgument(
                "empty array passed to write_memory".into(),
            ));
        }
        let mut s = self.lock();
        self.run_op(&mut s, |ch, s| ch.write_array(s, address, values, width))
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wraps one locked attempt with the retry policy.  Any failure drops
    /// priming so preparation commands re-run on the next attempt or the
    /// next public operation.
    fn run_op<T>(
        &self,
        s: &mut Session,
        mut op: impl FnMut(&Self, &mut Session) -> Result<T>,
    ) -> Result<T> {
        self.retry.run(
            s,
            |s| {
                let result = op(self, s);
                if result.is_err() {
                    s.primed = false;
                }
                result
            },
            |s, e| s.recover(e, self.config.port, self.config.timeout),
        )
    }

    /// Primes the connection if needed, then sends `cmd`.
    fn command(&self, s: &mut Session, cmd: &str) -> Result<Vec<u8>> {
        self.prime(s)?;
        self.command_raw(s, cmd)
    }

    /// Runs the preparation commands, once per connection lifetime.
    fn prime(&self, s: &mut Session) -> Result<()> {
        if !s.primed {
            for prep in &self.config.prepare_commands {
                self.command_raw(s, prep)?;
            }
            s.primed = true;
        }
        Ok(())
    }

    fn command_raw(&self, s: &mut Session, cmd: &str) -> Result<Vec<u8>> {
        trace!(">{cmd}");
        let out = s.exchange(cmd, self.config.timeout)?;
        Ok(self.filter_ignored(out))
    }

    fn filter_ignored(&self, out: Vec<u8>) -> Vec<u8> {
        if self.config.ignore_patterns.is_empty() {
            return out;
        }
        let kept: Vec<&[u8]> = out
            .split(|&b| b == b'\n')
            .filter(|line| {
                let text = String::from_utf8_lossy(line);
                !self
                    .config
                    .ignore_patterns
                    .iter()
                    .any(|re| re.is_match(&text))
            })
            .collect();
        kept.join(&b'\n')
    }

    /// Reads one chunk of up to [`READ_CHUNK_SIZE`] elements through the
    /// intermediate array variable.
    fn read_chunk(
        &self,
        s: &mut Session,
        address: u32,
        count: usize,
        width: Width,
    ) -> Result<Vec<u32>> {
        let var = &self.config.array_var;
        // Unset first: entries from a previous, longer read would otherwise
        // leak into a shorter one.
        self.command(s, &format!("array unset {var}"))?;
        self.command(
            s,
            &format!("mem2array {var} {} 0x{address:x} {count}", width.bits()),
        )?;
        let out = self.command(s, &format!("ocd_echo ${var}"))?;
        parse_array_response(&out, address)
    }

    fn write_array(
        &self,
        s: &mut Session,
        address: u32,
        values: &[u32],
        width: Width,
    ) -> Result<()> {
        let var = &self.config.array_var;
        let literal = values
            .iter()
            .enumerate()
            .map(|(index, value)| format!("{index} 0x{value:x}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.command(s, &format!("array unset {var}"))?;
        self.command(s, &format!("array set {var} {{ {literal} }}"))?;
        self.command(
            s,
            &format!(
                "array2mem {var} {} 0x{address:x} {}",
                width.bits(),
                values.len()
            ),
        )?;
        Ok(())
    }
}

impl MemIo for RpcChannel {
    fn read_word(&self, addr: u32) -> Result<u32> {
        RpcChannel::read_word(self, addr)
    }

    fn write_word(&self, addr: u32, value: u32) -> Result<()> {
        RpcChannel::write_word(self, addr, value)
    }

    fn read_words(&self, addr: u32, count: usize) -> Result<Vec<u32>> {
        self.read_memory(addr, count, Width::Word)
    }

    fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let words = self.read_memory(addr, len, Width::Byte)?;
        Ok(words.into_iter().map(|v| v as u8).collect())
    }

    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<()> {
        let values: Vec<u32> = data.iter().map(|&b| u32::from(b)).collect();
        self.write_memory(addr, &values, Width::Byte)
    }
}

/// Parses a word dump response of the form `"<addr>: <hex-value>"`.
fn parse_word_response(out: &[u8], address: u32) -> Result<u32> {
    let text = String::from_utf8_lossy(out);
    let text = text.trim();
    let Some((addr_part, value_part)) = text
        .split_once(':')
        .filter(|(_, rest)| !rest.contains(':'))
    else {
        return Err(Error::Protocol(format!(
            "failed to read memory at 0x{address:x}, got: \"{text}\""
        )));
    };
    let echoed = crate::parse_u32(addr_part).ok_or_else(|| {
        Error::Protocol(format!("bad address field \"{addr_part}\" in word dump"))
    })?;
    if echoed != address {
        return Err(Error::Protocol(format!(
            "unexpected address {addr_part}, wanted 0x{address:x}"
        )));
    }
    u32::from_str_radix(value_part.trim(), 16).map_err(|_| {
        Error::Protocol(format!("bad value field \"{}\" in word dump", value_part.trim()))
    })
}

/// Parses a `mem2array` echo: flat decimal `(index, value)` pairs in
/// arbitrary order.  Returns values sorted by index.
fn parse_array_response(out: &[u8], address: u32) -> Result<Vec<u32>> {
    let text = String::from_utf8_lossy(out);
    let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
    if tokens.len() % 2 != 0 {
        return Err(Error::Protocol(format!(
            "odd token count {} in mem2array response at 0x{address:x}",
            tokens.len()
        )));
    }
    let mut pairs = Vec::with_capacity(tokens.len() / 2);
    for pair in tokens.chunks_exact(2) {
        let index: u32 = pair[0].parse().map_err(|_| {
            Error::Protocol(format!("bad index token \"{}\" in mem2array response", pair[0]))
        })?;
        let value: u32 = pair[1].parse().map_err(|_| {
            Error::Protocol(format!("bad value token \"{}\" in mem2array response", pair[1]))
        })?;
        pairs.push((index, value));
    }
    pairs.sort_unstable_by_key(|&(index, _)| index);
    Ok(pairs.into_iter().map(|(_, value)| value).collect())
}
