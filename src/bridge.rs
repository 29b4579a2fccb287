//! Local actors feeding bytes into the link.
//!
//! Two byte sources exist: the interactive console (stdin) and an optional
//! localhost TCP bridge.  Both run on their own threads, both deliver
//! arbitrary-length chunks to [`BuffyLink::write`] in arrival order per
//! source, and neither coordinates with the other - the RPC channel
//! serializes their remote operations, interleaving between sources is
//! unspecified and acceptable.
//!
//! Losing the console reader (EOF, read error) cancels the shared
//! [`LiveToken`], so the watch loop never outlives its operator.  A bridge
//! peer disconnecting only ends that connection.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;
use crate::io::MemIo;
use crate::link::{BuffyLink, LiveToken};

/// Spawns the console reader thread.
///
/// Blocks on stdin and injects every chunk into the RX ring.  Exits - and
/// cancels `live` - on EOF, a read failure, or a failed remote write.
pub fn spawn_console_reader<M: MemIo + 'static>(
    link: Arc<BuffyLink<M>>,
    live: LiveToken,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("console_reader".into())
        .spawn(move || {
            console_reader(&link, &live);
            info!("console reader exited");
            live.cancel();
        })?;
    Ok(handle)
}

fn console_reader<M: MemIo>(link: &BuffyLink<M>, live: &LiveToken) {
    let mut stdin = std::io::stdin().lock();
    let mut buf = [0u8; 256];
    while live.is_live() {
        match stdin.read(&mut buf) {
            Ok(0) => {
                debug!("stdin reached EOF");
                break;
            }
            Ok(n) => {
                if let Err(e) = link.write(&buf[..n]) {
                    error!("console write failed: {e}");
                    break;
                }
            }
            Err(e) => {
                error!("console read failed: {e}");
                break;
            }
        }
    }
}

/// Localhost TCP listener forwarding received chunks into the RX ring.
///
/// Accepts any number of connections, one reader thread each.  Useful for
/// piping a file or another program into the target without tying up the
/// console.
pub struct TcpBridge {
    local_addr: SocketAddr,
}

impl TcpBridge {
    /// Binds `127.0.0.1:<port>` and starts the accept loop.  Port 0 picks an
    /// ephemeral port; see [`Self::local_addr`].
    pub fn spawn<M: MemIo + 'static>(
        port: u16,
        link: Arc<BuffyLink<M>>,
        live: LiveToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let local_addr = listener.local_addr()?;
        info!("tcp bridge listening on {local_addr}");
        thread::Builder::new()
            .name("tcp_bridge".into())
            .spawn(move || accept_loop(listener, link, live))?;
        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn accept_loop<M: MemIo + 'static>(
    listener: TcpListener,
    link: Arc<BuffyLink<M>>,
    live: LiveToken,
) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                debug!(
                    "bridge connection from {}",
                    stream
                        .peer_addr()
                        .map_or_else(|_| "<unknown>".into(), |a| a.to_string())
                );
                let link = Arc::clone(&link);
                let live = live.clone();
                let spawned = thread::Builder::new()
                    .name("bridge_conn".into())
                    .spawn(move || connection_loop(stream, &link, &live));
                if spawned.is_err() {
                    warn!("failed to spawn bridge connection thread");
                }
            }
            Err(e) => warn!("bridge accept failed: {e}"),
        }
    }
}

fn connection_loop<M: MemIo>(mut stream: TcpStream, link: &BuffyLink<M>, live: &LiveToken) {
    let mut buf = [0u8; 256];
    while live.is_live() {
        match stream.read(&mut buf) {
            Ok(0) => {
                debug!("bridge socket closed");
                break;
            }
            Ok(n) => {
                if let Err(e) = link.write(&buf[..n]) {
                    error!("bridge write failed: {e}");
                    break;
                }
            }
            // Peer reset ends this connection only.
            Err(e) => {
                debug!("bridge socket closed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::cache::{AddressCache, MemStore};
    use crate::io::fake::FakeTargetRam;
    use crate::link::{BUFFY_MAGIC, LinkConfig};

    const RAM_START: u32 = 0x1000_0000;

    fn fake_link() -> (Arc<FakeTargetRam>, Arc<BuffyLink<FakeTargetRam>>) {
        let ram = Arc::new(FakeTargetRam::new(RAM_START, 1024));
        ram.poke_word(RAM_START, BUFFY_MAGIC);
        ram.poke_word(RAM_START + 4, 4);
        ram.poke_word(RAM_START + 8, 4);
        let config = LinkConfig {
            address: Some(RAM_START),
            ..LinkConfig::default()
        };
        let mut cache = AddressCache::new(MemStore::default());
        let link = BuffyLink::attach(Arc::clone(&ram), &config, &mut cache).unwrap();
        (ram, Arc::new(link))
    }

    fn wait_for_rx_head(ram: &FakeTargetRam, expected: u32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while ram.peek_word(RAM_START + 24) != expected {
            assert!(Instant::now() < deadline, "rx head never reached {expected}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn bridge_forwards_chunks_into_the_rx_ring() {
        let (ram, link) = fake_link();
        let live = LiveToken::new();
        let bridge = TcpBridge::spawn(0, Arc::clone(&link), live.clone()).unwrap();

        let mut peer = TcpStream::connect(bridge.local_addr()).unwrap();
        peer.write_all(b"hello").unwrap();
        wait_for_rx_head(&ram, 5);
        let rx_buf = ram.read_bytes(RAM_START + 32 + 16, 5).unwrap();
        assert_eq!(rx_buf, b"hello");
        live.cancel();
    }

    #[test]
    fn bridge_accepts_multiple_connections() {
        let (ram, link) = fake_link();
        let live = LiveToken::new();
        let bridge = TcpBridge::spawn(0, Arc::clone(&link), live.clone()).unwrap();

        let mut first = TcpStream::connect(bridge.local_addr()).unwrap();
        first.write_all(b"one").unwrap();
        wait_for_rx_head(&ram, 3);
        drop(first);

        let mut second = TcpStream::connect(bridge.local_addr()).unwrap();
        second.write_all(b"two").unwrap();
        wait_for_rx_head(&ram, 6);
        live.cancel();
    }
}
