// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::Config,
    error::Error,
    platform::logging,
    stack::{EngineHandle, TunStack},
    state_machine::{
        NextTunnelState, SharedState, TunnelCommand, TunnelState, TunnelStateHandler,
    },
    tun::TunDevice,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct StartingState;

impl StartingState {
    pub fn enter() -> (Box<dyn TunnelStateHandler>, TunnelState) {
        (Box::new(Self), TunnelState::Starting)
    }

    async fn start_engine(
        shared_state: &mut SharedState,
    ) -> Result<(EngineHandle, mpsc::Receiver<Error>), Error> {
        let config = Config::from_file(&shared_state.config_path)?;
        logging::init_logging(config.misc.log_level, config.misc.log_file.as_deref());
        info!(
            "starting tunnel {} -> socks5 {}",
            config.tunnel.name,
            config.socks5.server_addr()
        );

        let device = TunDevice::from_descriptor(
            shared_state.descriptor,
            &config.tunnel.name,
            config.tunnel.multi_queue.queues(),
        )
        .map_err(Error::Descriptor)?;

        Ok(TunStack::start(&config, device, shared_state.stats.clone()))
    }
}

#[async_trait::async_trait]
impl TunnelStateHandler for StartingState {
    async fn handle_event(
        mut self: Box<Self>,
        _shutdown_token: &CancellationToken,
        _command_rx: &'async_trait mut mpsc::UnboundedReceiver<TunnelCommand>,
        shared_state: &'async_trait mut SharedState,
    ) -> NextTunnelState {
        // Setup is local work (config parse, descriptor dup); a stop arriving
        // meanwhile is observed by the running state right after.
        match Self::start_engine(shared_state).await {
            Ok((engine, fatal_rx)) => {
                NextTunnelState::NewState(RunningState::enter(engine, fatal_rx))
            }
            Err(err) => {
                error!("failed to start the engine: {err}");
                shared_state.send_failure(err);
                NextTunnelState::Finished
            }
        }
    }
}

pub struct RunningState {
    engine: EngineHandle,
    fatal_rx: mpsc::Receiver<Error>,
}

impl RunningState {
    pub fn enter(
        engine: EngineHandle,
        fatal_rx: mpsc::Receiver<Error>,
    ) -> (Box<dyn TunnelStateHandler>, TunnelState) {
        (Box::new(Self { engine, fatal_rx }), TunnelState::Running)
    }
}

#[async_trait::async_trait]
impl TunnelStateHandler for RunningState {
    async fn handle_event(
        mut self: Box<Self>,
        shutdown_token: &CancellationToken,
        command_rx: &'async_trait mut mpsc::UnboundedReceiver<TunnelCommand>,
        shared_state: &'async_trait mut SharedState,
    ) -> NextTunnelState {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                NextTunnelState::NewState(StoppingState::enter(self.engine))
            }
            Some(command) = command_rx.recv() => {
                match command {
                    TunnelCommand::Stop => {
                        NextTunnelState::NewState(StoppingState::enter(self.engine))
                    }
                }
            }
            Some(err) = self.fatal_rx.recv() => {
                error!("engine hit a fatal error: {err}");
                shared_state.send_failure(err);
                NextTunnelState::NewState(StoppingState::enter(self.engine))
            }
            else => {
                // Both channels are gone; the controller went away.
                NextTunnelState::NewState(StoppingState::enter(self.engine))
            }
        }
    }
}

pub struct StoppingState {
    engine: EngineHandle,
}

impl StoppingState {
    pub fn enter(engine: EngineHandle) -> (Box<dyn TunnelStateHandler>, TunnelState) {
        (Box::new(Self { engine }), TunnelState::Stopping)
    }
}

#[async_trait::async_trait]
impl TunnelStateHandler for StoppingState {
    async fn handle_event(
        mut self: Box<Self>,
        _shutdown_token: &CancellationToken,
        _command_rx: &'async_trait mut mpsc::UnboundedReceiver<TunnelCommand>,
        _shared_state: &'async_trait mut SharedState,
    ) -> NextTunnelState {
        self.engine.shutdown(SHUTDOWN_GRACE).await;
        info!("tunnel stopped");
        NextTunnelState::Finished
    }
}
