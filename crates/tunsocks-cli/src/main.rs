// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

mod commands;
mod error;
mod shutdown_handler;

use std::{os::unix::io::AsRawFd, sync::Arc};

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tunsocks_lib::{
    state_machine::{TunnelEvent, TunnelState, TunnelStateMachine},
    Config, TrafficStats,
};

use commands::CliArgs;
use error::{Error, Result};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    setup_logging();

    if !args.skip_root_check {
        check_root_privileges()?;
    }

    run(args).await
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

#[cfg(unix)]
fn check_root_privileges() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        tracing::debug!("Root privileges acquired");
        Ok(())
    } else {
        Err(Error::RootPrivilegesRequired {
            binary_name: "tunsocks".to_string(),
        })
    }
}

#[cfg(not(unix))]
fn check_root_privileges() -> Result<()> {
    tracing::debug!("Platform not supported for root privilege check");
    Ok(())
}

/// Create the TUN device described by the config. The engine itself only
/// ever sees the device's descriptor, exactly as when it is embedded.
fn create_tun_device(config: &Config) -> Result<tun::platform::Device> {
    let mut tun_config = tun::Configuration::default();
    tun_config
        .name(&config.tunnel.name)
        .mtu(i32::from(config.tunnel.mtu))
        .address(config.tunnel.ipv4.ip())
        .netmask(config.tunnel.ipv4.mask())
        .up();

    Ok(tun::create(&tun_config)?)
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = Config::from_file(&args.config)?;
    let device = create_tun_device(&config)?;
    tracing::info!(
        "created tun device {} ({})",
        config.tunnel.name,
        config.tunnel.ipv4
    );

    let stats = Arc::new(TrafficStats::new());
    let (_command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let shutdown_token = CancellationToken::new();

    let state_machine_handle = TunnelStateMachine::spawn(
        args.config,
        device.as_raw_fd(),
        stats.clone(),
        command_rx,
        event_tx,
        shutdown_token.clone(),
    );
    let signal_handle = shutdown_handler::install(shutdown_token);

    while let Some(event) = event_rx.recv().await {
        match event {
            TunnelEvent::NewState(TunnelState::Stopped) => break,
            TunnelEvent::NewState(state) => tracing::info!("tunnel state: {state:?}"),
            TunnelEvent::Failed(err) => tracing::error!("tunnel failed: {err}"),
        }
    }

    state_machine_handle.await?;
    signal_handle.abort();

    let snapshot = stats.snapshot();
    tracing::info!(
        "relayed {} bytes in / {} bytes out ({} / {} packets)",
        snapshot.bytes_in,
        snapshot.bytes_out,
        snapshot.packets_in,
        snapshot.packets_out,
    );

    // The device stays open until the engine is fully stopped.
    drop(device);
    Ok(())
}
