// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

mod config;
mod io_loop;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use telemetry_core::session::ServerSession;
use telemetry_core::sink::JsonlSink;

use config::ServerConfig;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::load()?;

    std::fs::create_dir_all(&config.log_directory).map_err(|e| {
        anyhow::anyhow!(
            "log directory {} is unwritable: {e}",
            config.log_directory.display()
        )
    })?;
    let sink = JsonlSink::new(config.log_directory.join("records.jsonl"));
    let session = Arc::new(ServerSession::new(sink));

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    let bind_addr = SocketAddr::new(config.host, config.port);
    io_loop::run(bind_addr, config.max_packet_size, session, running)
}
