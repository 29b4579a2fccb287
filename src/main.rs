//! `buffy` - interactive console for buffy-enabled firmware, over OpenOCD's
//! Tcl RPC port.
//!
//! Wires the three actors together: the watch loop on the main thread
//! (TX ring → stdout), the console reader (stdin → RX ring) and the
//! optional TCP bridge (socket → RX ring).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;
use regex::Regex;

use buffy_link::bridge::{self, TcpBridge};
use buffy_link::cache::{AddressCache, FsStore};
use buffy_link::link::{BuffyLink, LinkConfig, LiveToken};
use buffy_link::rpc::{DEFAULT_PORT, RpcChannel, RpcConfig};

fn parse_address(s: &str) -> Result<u32, String> {
    buffy_link::parse_u32(s).ok_or_else(|| format!("not a number: \"{s}\""))
}

#[derive(Debug, Parser)]
#[command(
    name = "buffy",
    version,
    about = "Interactive console for buffy-enabled firmware, carried over a debug probe"
)]
struct Args {
    /// OpenOCD TCP RPC port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// RAM starting address for the structure scan (hex accepted)
    #[arg(long, value_parser = parse_address, default_value = "0x10000000")]
    ram_start: u32,

    /// Size of RAM to scan
    #[arg(long, value_parser = parse_address, default_value = "0x20000")]
    ram_size: u32,

    /// Known structure address; skips the scan
    #[arg(long, value_parser = parse_address)]
    address: Option<u32>,

    /// Target name used to store/recall the previous structure address
    #[arg(long, default_value = "default")]
    target_name: String,

    /// Command(s) to execute once per connection, before normal traffic
    #[arg(long = "prepare-command")]
    prepare_commands: Vec<String>,

    /// Number of attempts per RPC operation
    #[arg(long, default_value_t = 1)]
    tries: u32,

    /// TCP port to listen on; data received there is sent over the link
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Seconds between update queries when the link is idle
    #[arg(long, default_value_t = 0.5)]
    poll_interval: f64,

    /// Regular expression(s) filtering junk lines out of RPC responses
    #[arg(long = "ignore-regexp")]
    ignore_regexps: Vec<String>,

    /// Print debug info
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    let ignore_patterns = args
        .ignore_regexps
        .iter()
        .map(|r| Regex::new(r).with_context(|| format!("bad ignore regexp \"{r}\"")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let rpc = Arc::new(
        RpcChannel::connect(RpcConfig {
            port: args.port,
            prepare_commands: args.prepare_commands.clone(),
            tries: args.tries,
            ignore_patterns,
            ..RpcConfig::default()
        })
        .context("failed to connect to the RPC daemon")?,
    );

    let mut cache = AddressCache::new(FsStore::at_home());
    let link_config = LinkConfig {
        address: args.address,
        ram_start: args.ram_start,
        ram_size: args.ram_size,
        target_name: args.target_name.clone(),
        poll_interval: Duration::from_secs_f64(args.poll_interval),
    };
    let link = Arc::new(
        BuffyLink::attach(rpc, &link_config, &mut cache)
            .context("failed to attach to the buffy structure")?,
    );

    let live = LiveToken::new();
    let reader = bridge::spawn_console_reader(Arc::clone(&link), live.clone())?;
    let _bridge = match args.tcp_port {
        Some(port) => Some(TcpBridge::spawn(port, Arc::clone(&link), live.clone())?),
        None => None,
    };

    let watch_result = link.watch(&live, |bytes| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    });
    live.cancel();
    if watch_result.is_ok() {
        // Orderly shutdown: the token was cancelled by (or because of) the
        // reader, so this join does not block on stdin.
        let _ = reader.join();
    }
    watch_result.map_err(Into::into)
}
