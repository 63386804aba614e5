// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

use std::{path::Path, sync::Once};

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

static INIT: Once = Once::new();

/// Configure logging with the `tracing-subscriber` library, once per
/// process. The config file's `log-level` supplies the default directive;
/// `RUST_LOG` still wins when set. With a usable `log-file` destination,
/// output goes to that file instead of stderr. Re-initialization attempts (a
/// second engine start, an embedder that already installed a subscriber) are
/// no-ops.
pub(crate) fn init_logging(level: LogLevel, log_file: Option<&Path>) {
    INIT.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(level.level_filter().into())
            .from_env_lossy();

        let log_builder = tracing_subscriber::fmt().with_env_filter(filter).compact();

        if let Some(appender) = log_file.and_then(try_make_writer) {
            let _ = log_builder.with_writer(appender).with_ansi(false).try_init();
        } else {
            let _ = log_builder.try_init();
        }
    });
}

fn try_make_writer(path: &Path) -> Option<tracing_appender::rolling::RollingFileAppender> {
    let (log_dir, filename) = if path.is_dir() {
        (path, Path::new("tunsocks.log"))
    } else {
        (path.parent()?, Path::new(path.file_name()?))
    };

    if !log_dir.as_os_str().is_empty() && !log_dir.try_exists().unwrap_or(false) {
        return None;
    }

    Some(tracing_appender::rolling::never(log_dir, filename))
}
