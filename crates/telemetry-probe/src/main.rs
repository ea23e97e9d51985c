// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use std::net::UdpSocket;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::Parser;
use telemetry_core::protocol::{decode_datagram, MessageKind};
use telemetry_core::sampler::ClientSampler;
use telemetry_core::session::ClientSession;

/// Synthetic telemetry device: samples values and streams them to a
/// collector over UDP (§4.6, §4.7).
#[derive(Debug, Parser)]
#[command(name = "telemetry-probe")]
struct Cli {
    /// Collector host to send datagrams to.
    host: String,

    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Seconds between sampler ticks.
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// Total run time in seconds before flushing and sending SHUTDOWN.
    #[arg(long, default_value_t = 60.0)]
    duration: f64,

    /// Minimum |delta| that is worth sending as DATA_DELTA instead of a
    /// HEARTBEAT.
    #[arg(long = "delta-thresh", default_value_t = 1)]
    delta_thresh: u32,

    /// Device MAC address, colon-separated hex (e.g. aa:bb:cc:dd:ee:ff).
    #[arg(long, default_value = "02:00:00:00:00:01")]
    mac: String,

    /// Seed for the deterministic sampler.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Batch size; 1 disables batching.
    #[arg(long, default_value_t = 1)]
    batching: u8,
}

fn parse_mac(s: &str) -> anyhow::Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        bail!("MAC address must have 6 colon-separated octets, got {s}");
    }
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).with_context(|| format!("invalid MAC octet {part}"))?;
    }
    Ok(mac)
}

fn epoch_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("telemetry-probe failed: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mac = parse_mac(&cli.mac)?;

    let socket = UdpSocket::bind("0.0.0.0:0").context("binding local UDP socket")?;
    let collector: std::net::SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .context("resolving collector address")?;
    socket.connect(collector).context("connecting to collector")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::Relaxed);
        })?;
    }

    let mut client = ClientSession::new(mac, cli.batching, cli.delta_thresh);
    handshake(&socket, &mut client)?;

    let base_time = epoch_now();
    socket.send(&client.build_time_sync(base_time))?;

    let mut sampler = ClientSampler::new(cli.seed);
    let first_value = sampler.next_sample();
    socket.send(&client.build_initial_keyframe(first_value, epoch_now()))?;

    let tick_interval = Duration::from_secs_f64(cli.interval.max(0.0));
    let start = Instant::now();
    let run_for = Duration::from_secs_f64(cli.duration.max(0.0));

    while running.load(Ordering::Relaxed) && start.elapsed() < run_for {
        spin_sleep::sleep(tick_interval);
        let sample = sampler.next_sample();
        for outbound in client.tick(sample, epoch_now()) {
            socket
                .send(&outbound.bytes)
                .with_context(|| format!("sending {:?}", outbound.kind))?;
        }
    }

    for outbound in client.shutdown(epoch_now()) {
        socket
            .send(&outbound.bytes)
            .with_context(|| format!("sending {:?} during shutdown", outbound.kind))?;
    }

    Ok(())
}

/// STARTUP handshake with a bounded retry: 3 attempts, 1 second each
/// (§4.7, §5).
fn handshake(socket: &UdpSocket, client: &mut ClientSession) -> anyhow::Result<()> {
    socket.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut buf = [0u8; 64];
    for attempt in 1..=3 {
        socket
            .send(&client.build_startup())
            .context("sending STARTUP")?;

        match socket.recv(&mut buf) {
            Ok(len) => {
                let (header, _) = decode_datagram(&buf[..len]).context("decoding STARTUP_ACK")?;
                if header.kind != MessageKind::StartupAck {
                    log::warn!("expected STARTUP_ACK, got {:?}", header.kind);
                    continue;
                }
                client.accept_startup_ack(&buf[..len])?;
                log::info!("registered as device {}", client.device_id());
                return Ok(());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                log::warn!("STARTUP attempt {attempt} timed out, retrying");
            }
            Err(err) => return Err(err).context("receiving STARTUP_ACK"),
        }
    }

    bail!("STARTUP handshake failed after 3 attempts")
}
