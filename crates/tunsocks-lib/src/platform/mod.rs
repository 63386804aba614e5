// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! The boundary the embedding application talks to: synchronous
//! `start`/`stop`/`get_stats` over a process-wide runtime.
//!
//! `start` returns quickly; everything that can fail asynchronously (config
//! parsing, descriptor setup, a dying descriptor at runtime) is reported
//! through the registered failure callback instead of a return value the
//! caller would have to await.

pub mod ffi;
pub(crate) mod logging;

use std::{os::fd::RawFd, path::PathBuf, sync::Arc};

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tokio::{runtime::Runtime, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    state_machine::{TunnelCommand, TunnelEvent, TunnelState, TunnelStateMachine},
    stats::{TrafficSnapshot, TrafficStats},
};

pub type FailureCallback = Box<dyn Fn(&Error) + Send + Sync>;

lazy_static! {
    static ref RUNTIME: Runtime = Runtime::new().expect("failed to create global runtime");
    static ref ENGINE_HANDLE: tokio::sync::Mutex<Option<EngineHandle>> =
        tokio::sync::Mutex::new(None);
    static ref CURRENT_STATS: RwLock<Option<Arc<TrafficStats>>> = RwLock::new(None);
    static ref FAILURE_CALLBACK: RwLock<Option<FailureCallback>> = RwLock::new(None);
}

struct EngineHandle {
    command_sender: mpsc::UnboundedSender<TunnelCommand>,
    shutdown_token: CancellationToken,
    machine_handle: JoinHandle<()>,
    event_handle: JoinHandle<()>,
}

/// Register the callback invoked on unrecoverable failures. Replaces any
/// previously registered callback.
pub fn set_failure_callback(callback: FailureCallback) {
    *FAILURE_CALLBACK.write() = Some(callback);
}

pub fn clear_failure_callback() {
    *FAILURE_CALLBACK.write() = None;
}

fn report_failure(error: &Error) {
    if let Some(callback) = FAILURE_CALLBACK.read().as_ref() {
        callback(error);
    }
}

/// Start the engine with a config file path and an already-open TUN
/// descriptor. Valid only while stopped. Returns once the engine run is
/// spawned; startup failures arrive through the failure callback.
pub fn start(config_path: &str, descriptor: RawFd) -> Result<()> {
    RUNTIME.block_on(start_inner(PathBuf::from(config_path), descriptor))
}

async fn start_inner(config_path: PathBuf, descriptor: RawFd) -> Result<()> {
    let mut guard = ENGINE_HANDLE.lock().await;
    if guard.is_some() {
        return Err(Error::AlreadyRunning);
    }

    let stats = Arc::new(TrafficStats::new());
    let (command_sender, command_receiver) = mpsc::unbounded_channel();
    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let shutdown_token = CancellationToken::new();

    let machine_handle = TunnelStateMachine::spawn(
        config_path,
        descriptor,
        stats.clone(),
        command_receiver,
        event_sender,
        shutdown_token.clone(),
    );
    let event_handle = tokio::spawn(handle_tunnel_events(event_receiver));

    *CURRENT_STATS.write() = Some(stats);
    *guard = Some(EngineHandle {
        command_sender,
        shutdown_token,
        machine_handle,
        event_handle,
    });
    Ok(())
}

/// Forward failure events to the embedder and clear the engine handle once
/// the machine reports back `Stopped`.
async fn handle_tunnel_events(mut event_receiver: mpsc::UnboundedReceiver<TunnelEvent>) {
    while let Some(event) = event_receiver.recv().await {
        match event {
            TunnelEvent::NewState(TunnelState::Stopped) => {
                debug!("engine reported stopped");
                ENGINE_HANDLE.lock().await.take();
                break;
            }
            TunnelEvent::NewState(state) => debug!("engine state: {state:?}"),
            TunnelEvent::Failed(error) => {
                warn!("engine failure: {error}");
                report_failure(&error);
            }
        }
    }
}

/// Stop the engine and wait for every task to wind down. A no-op when
/// nothing is running.
pub fn stop() {
    if let Err(Error::NotRunning) = RUNTIME.block_on(stop_inner()) {
        debug!("stop requested while already stopped");
    }
}

async fn stop_inner() -> Result<()> {
    let handle = {
        let mut guard = ENGINE_HANDLE.lock().await;
        guard.take().ok_or(Error::NotRunning)?
    };

    let _ = handle.command_sender.send(TunnelCommand::Stop);
    handle.shutdown_token.cancel();

    if let Err(err) = handle.machine_handle.await {
        warn!("state machine task failed on join: {err}");
    }
    handle.event_handle.abort();
    Ok(())
}

/// Snapshot of the traffic counters. Zeros before the first start; retains
/// the final counters after a stop until the next start resets them.
pub fn get_stats() -> TrafficSnapshot {
    CURRENT_STATS
        .read()
        .as_ref()
        .map(|stats| stats.snapshot())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Write,
        os::fd::AsRawFd,
        sync::mpsc as std_mpsc,
        time::Duration,
    };

    use crate::tun::tests::descriptor_pair;

    // The platform surface is process-global; a single sequential test
    // exercises the whole lifecycle to keep runs deterministic.
    #[test]
    fn platform_lifecycle() {
        assert_eq!(get_stats(), TrafficSnapshot::default());

        // stop() before any start is a no-op.
        stop();
        stop();

        // A bad config makes start() itself succeed but reports the failure
        // through the callback, leaving the engine stopped.
        let (failure_tx, failure_rx) = std_mpsc::channel();
        set_failure_callback(Box::new(move |error| {
            let _ = failure_tx.send(error.to_string());
        }));

        let mut bad_config = tempfile::NamedTempFile::new().unwrap();
        bad_config
            .write_all(
                b"tunnel:\n  mtu: 1500\n  ipv4: 10.0.0.2\nsocks5:\n  port: 0\n  address: 127.0.0.1\n",
            )
            .unwrap();
        bad_config.flush().unwrap();

        let (_keep_alive, descriptor) = descriptor_pair();
        start(bad_config.path().to_str().unwrap(), descriptor.as_raw_fd()).unwrap();

        let failure = failure_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("failure callback not invoked");
        assert!(failure.contains("configuration"));

        // The failed run winds down on its own; wait for the handle to clear.
        wait_until_stopped();
        assert_eq!(get_stats(), TrafficSnapshot::default());

        // A valid config starts, refuses a second start, and stops cleanly.
        let mut config = tempfile::NamedTempFile::new().unwrap();
        config
            .write_all(
                b"tunnel:\n  name: tun0\n  mtu: 1500\n  ipv4: 10.0.0.2/24\nsocks5:\n  port: 10808\n  address: 127.0.0.1\n  udp: 'udp'\n",
            )
            .unwrap();
        config.flush().unwrap();

        start(config.path().to_str().unwrap(), descriptor.as_raw_fd()).unwrap();
        assert!(matches!(
            start(config.path().to_str().unwrap(), descriptor.as_raw_fd()),
            Err(Error::AlreadyRunning)
        ));

        stop();
        stop(); // idempotent

        clear_failure_callback();
    }

    fn wait_until_stopped() {
        for _ in 0..100 {
            if RUNTIME.block_on(async { ENGINE_HANDLE.lock().await.is_none() }) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("engine did not return to stopped");
    }
}
