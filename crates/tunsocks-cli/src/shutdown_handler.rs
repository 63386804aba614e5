// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `shutdown_token` on ctrl-c, SIGTERM or SIGQUIT.
pub(crate) fn install(shutdown_token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigquit) =
                match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
                    (Ok(sigterm), Ok(sigquit)) => (sigterm, sigquit),
                    _ => {
                        error!("Failed to install the termination signal handlers");
                        return;
                    }
                };

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Failed to wait for ctrl-c: {e}");
                    } else {
                        info!("Received Ctrl-C signal.");
                    }
                }
                _ = sigterm.recv() => info!("Received SIGTERM signal."),
                _ = sigquit.recv() => info!("Received SIGQUIT signal."),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to wait for ctrl-c: {e}");
            } else {
                info!("Received Ctrl-C signal.");
            }
        }

        shutdown_token.cancel();
    })
}
