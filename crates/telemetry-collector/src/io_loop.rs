// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-socket UDP receive loop (§4.5), modeled on a `mio::Poll`-driven
//! listener: one socket, edge-triggered readiness, a bounded poll timeout
//! so the liveness sweep always gets a chance to run.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use telemetry_core::config::LIVENESS_SWEEP_INTERVAL_MS;
use telemetry_core::session::ServerSession;
use telemetry_core::sink::RecordSink;

const SOCKET_TOKEN: Token = Token(0);

pub fn run<S: RecordSink>(
    bind_addr: SocketAddr,
    max_packet_size: u16,
    session: Arc<ServerSession<S>>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut socket = UdpSocket::bind(bind_addr)?;
    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

    let mut events = Events::with_capacity(128);
    let mut buf = vec![0u8; max_packet_size as usize];
    let sweep_interval = Duration::from_millis(LIVENESS_SWEEP_INTERVAL_MS);
    let mut last_sweep = Instant::now();

    log::info!("telemetry-collector listening on {bind_addr}");

    while running.load(Ordering::Relaxed) {
        if let Err(err) = poll.poll(&mut events, Some(sweep_interval)) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }

        for event in events.iter() {
            if event.token() != SOCKET_TOKEN || !event.is_readable() {
                continue;
            }
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, source)) => {
                        let datagram = &buf[..len];
                        let outgoing = session.process_datagram(datagram, source, Local::now());
                        for reply in outgoing {
                            if let Err(err) = socket.send_to(&reply.bytes, reply.to) {
                                log::warn!("failed to send reply to {}: {err}", reply.to);
                            }
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        log::warn!("recv_from error: {err}");
                        break;
                    }
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(last_sweep) >= sweep_interval {
            session.run_liveness_sweep(now, Local::now());
            last_sweep = now;
        }
    }

    log::info!("shutting down, flushing log sink");
    session.sink().flush()?;
    Ok(())
}
