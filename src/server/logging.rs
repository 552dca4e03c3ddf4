// Copyright 2026 Medrag Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, registry::Registry, EnvFilter};

static SERVER_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize logging for server mode: console output plus daily-rotated
/// JSON log files when a log directory is configured.
pub fn init_server_logging(log_dir: Option<PathBuf>, debug_mode: bool) -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_mode {
            EnvFilter::new("info,medrag=debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let console_layer = fmt::Layer::new().with_target(false);

    let log_dir = match log_dir {
        Some(dir) => dir,
        None => crate::storage::get_system_storage_dir()?.join("logs"),
    };
    std::fs::create_dir_all(&log_dir)?;

    SERVER_LOG_DIR
        .set(log_dir.clone())
        .map_err(|_| anyhow::anyhow!("logging initialized twice"))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "medrag_server.log");
    let file_layer = fmt::Layer::new()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json();

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        log_directory = %log_dir.display(),
        debug_mode,
        "server logging initialized"
    );

    Ok(())
}

/// Get the current log directory
#[allow(dead_code)]
pub fn get_log_directory() -> Option<PathBuf> {
    SERVER_LOG_DIR.get().cloned()
}
