// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Daemon entry point.
//!
//! Usage: `fossibot-bridge [config-path]`. The CLI wrapper scripts
//! handle start/stop/status; this binary only runs the bridge in the
//! foreground until SIGTERM or SIGINT.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use fossibot_bridge::bridge::Bridge;
use fossibot_bridge::config::Config;
use fossibot_bridge::error::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/fossibot/config.json";

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("fossibot-bridge: {error}");
            return ExitCode::from(1);
        }
    };

    init_logging(&config);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "Cannot start async runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(Bridge::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error @ (Error::Config(_) | Error::Fatal(_))) => {
            tracing::error!(%error, "Startup failed");
            ExitCode::from(1)
        }
        Err(error) => {
            tracing::error!(%error, "Bridge terminated");
            ExitCode::from(2)
        }
    }
}

/// Structured logging to stderr or the configured log file. The
/// `LOG_LEVEL` environment variable and `daemon.log_level` feed the
/// filter; `RUST_LOG` wins when set explicitly.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fossibot_bridge={}", config.daemon.log_level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &config.daemon.log_file {
        Some(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    builder
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false)
                        .init();
                }
                Err(error) => {
                    eprintln!(
                        "fossibot-bridge: cannot open log file {}: {error}; using stderr",
                        path.display()
                    );
                    tracing_subscriber::fmt()
                        .with_env_filter(EnvFilter::new(format!(
                            "fossibot_bridge={}",
                            config.daemon.log_level
                        )))
                        .with_target(false)
                        .with_writer(std::io::stderr)
                        .init();
                }
            }
        }
        None => {
            builder.with_writer(std::io::stderr).init();
        }
    }
}
