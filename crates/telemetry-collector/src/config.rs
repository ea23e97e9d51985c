// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server configuration: environment/CLI via clap, with an optional JSON
//! config file overlay (§6).

use std::net::IpAddr;
use std::path::PathBuf;

use clap::parser::ValueSource;
use clap::{CommandFactory, FromArgMatches, Parser};
use serde::Deserialize;
use telemetry_core::config::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(name = "telemetry-collector", about = "UDP telemetry collector")]
pub struct Cli {
    /// Bind address.
    #[arg(long, env = "TELEMETRY_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Bind port.
    #[arg(long, env = "TELEMETRY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Receive buffer / encoder upper bound in bytes.
    #[arg(long, env = "TELEMETRY_MAX_PACKET_SIZE", default_value_t = DEFAULT_MAX_PACKET_SIZE)]
    pub max_packet_size: u16,

    /// Directory the log sink writes into.
    #[arg(long, env = "TELEMETRY_LOG_DIR", default_value = "./telemetry-logs")]
    pub log_directory: PathBuf,

    /// Optional JSON config file overlaying the fields above.
    #[arg(long, env = "TELEMETRY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

/// The subset of [`Cli`] fields a JSON config file may override (§6).
#[derive(Debug, Deserialize, Default)]
struct FileOverlay {
    host: Option<IpAddr>,
    port: Option<u16>,
    max_packet_size: Option<u16>,
    log_directory: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub max_packet_size: u16,
    pub log_directory: PathBuf,
}

impl ServerConfig {
    /// Parse CLI/env args and apply an optional config-file overlay; a
    /// missing config file is fine, a malformed one is a fatal startup
    /// error (§7 resource errors).
    ///
    /// Precedence is CLI flag/env var first, config file second, built-in
    /// default last: a field only takes its config-file value when the
    /// corresponding flag was not explicitly supplied on the command line
    /// or through its environment variable (§6).
    pub fn load() -> anyhow::Result<Self> {
        let matches = Cli::command().get_matches();
        let cli = Cli::from_arg_matches(&matches)
            .map_err(|e| anyhow::anyhow!("parsing arguments: {e}"))?;

        let mut config = ServerConfig {
            host: cli.host,
            port: cli.port,
            max_packet_size: cli.max_packet_size,
            log_directory: cli.log_directory,
        };

        if let Some(path) = &cli.config_file {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
            let overlay: FileOverlay = serde_json::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;

            let explicit = |id: &str| {
                matches!(
                    matches.value_source(id),
                    Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
                )
            };

            if !explicit("host") {
                if let Some(host) = overlay.host {
                    config.host = host;
                }
            }
            if !explicit("port") {
                if let Some(port) = overlay.port {
                    config.port = port;
                }
            }
            if !explicit("max_packet_size") {
                if let Some(max_packet_size) = overlay.max_packet_size {
                    config.max_packet_size = max_packet_size;
                }
            }
            if !explicit("log_directory") {
                if let Some(log_directory) = overlay.log_directory {
                    config.log_directory = log_directory;
                }
            }
        }

        Ok(config)
    }
}
