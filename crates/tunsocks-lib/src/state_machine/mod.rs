// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! Engine lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//!
//! One state machine task exists per engine run; it finishes once the engine
//! is back in `Stopped`.

mod states;

use std::{os::fd::RawFd, path::PathBuf, sync::Arc};

use states::StartingState;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{error::Error, stats::TrafficStats};

#[async_trait::async_trait]
trait TunnelStateHandler: Send {
    async fn handle_event(
        mut self: Box<Self>,
        shutdown_token: &CancellationToken,
        command_rx: &'async_trait mut mpsc::UnboundedReceiver<TunnelCommand>,
        shared_state: &'async_trait mut SharedState,
    ) -> NextTunnelState;
}

pub enum NextTunnelState {
    NewState((Box<dyn TunnelStateHandler>, TunnelState)),
    SameState(Box<dyn TunnelStateHandler>),
    Finished,
}

#[derive(Debug)]
pub enum TunnelCommand {
    Stop,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug)]
pub enum TunnelEvent {
    NewState(TunnelState),
    Failed(Error),
}

pub struct SharedState {
    config_path: PathBuf,
    descriptor: RawFd,
    stats: Arc<TrafficStats>,
    event_sender: mpsc::UnboundedSender<TunnelEvent>,
}

impl SharedState {
    fn send_failure(&self, error: Error) {
        let _ = self.event_sender.send(TunnelEvent::Failed(error));
    }
}

pub struct TunnelStateMachine {
    current_state_handler: Box<dyn TunnelStateHandler>,
    shared_state: SharedState,
    command_receiver: mpsc::UnboundedReceiver<TunnelCommand>,
    event_sender: mpsc::UnboundedSender<TunnelEvent>,
    shutdown_token: CancellationToken,
}

impl TunnelStateMachine {
    pub fn spawn(
        config_path: PathBuf,
        descriptor: RawFd,
        stats: Arc<TrafficStats>,
        command_receiver: mpsc::UnboundedReceiver<TunnelCommand>,
        event_sender: mpsc::UnboundedSender<TunnelEvent>,
        shutdown_token: CancellationToken,
    ) -> JoinHandle<()> {
        let (current_state_handler, initial_state) = StartingState::enter();
        let _ = event_sender.send(TunnelEvent::NewState(initial_state));

        let shared_state = SharedState {
            config_path,
            descriptor,
            stats,
            event_sender: event_sender.clone(),
        };

        let tunnel_state_machine = Self {
            current_state_handler,
            shared_state,
            command_receiver,
            event_sender,
            shutdown_token,
        };

        tokio::spawn(tunnel_state_machine.run())
    }

    async fn run(mut self) {
        loop {
            let next_state = self
                .current_state_handler
                .handle_event(
                    &self.shutdown_token,
                    &mut self.command_receiver,
                    &mut self.shared_state,
                )
                .await;

            match next_state {
                NextTunnelState::NewState((new_state_handler, new_state)) => {
                    self.current_state_handler = new_state_handler;

                    debug!("new tunnel state: {:?}", new_state);
                    let _ = self.event_sender.send(TunnelEvent::NewState(new_state));
                }
                NextTunnelState::SameState(same_state) => {
                    self.current_state_handler = same_state;
                }
                NextTunnelState::Finished => break,
            }
        }

        let _ = self
            .event_sender
            .send(TunnelEvent::NewState(TunnelState::Stopped));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, os::fd::AsRawFd, time::Duration};

    use crate::tun::tests::descriptor_pair;

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TunnelEvent>) -> TunnelEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for tunnel event")
            .expect("event channel closed")
    }

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn valid_config() -> tempfile::NamedTempFile {
        write_config(
            "tunnel:\n  name: tun0\n  mtu: 1500\n  ipv4: 10.0.0.2/24\nsocks5:\n  port: 10808\n  address: 127.0.0.1\n  udp: 'udp'\nmisc:\n  log-level: error\n",
        )
    }

    #[tokio::test]
    async fn start_then_stop_walks_the_full_state_cycle() {
        let config = valid_config();
        let (_keep_alive, descriptor) = descriptor_pair();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut events) = mpsc::unbounded_channel();

        let handle = TunnelStateMachine::spawn(
            config.path().to_path_buf(),
            descriptor.as_raw_fd(),
            Arc::new(TrafficStats::new()),
            command_rx,
            event_tx,
            CancellationToken::new(),
        );

        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Starting)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Running)
        ));

        command_tx.send(TunnelCommand::Stop).unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Stopping)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Stopped)
        ));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("state machine did not finish")
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_config_fails_start_and_finishes_stopped() {
        let config = write_config(
            "tunnel:\n  mtu: 1500\n  ipv4: 10.0.0.2\nsocks5:\n  port: 0\n  address: 127.0.0.1\n",
        );
        let (_keep_alive, descriptor) = descriptor_pair();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut events) = mpsc::unbounded_channel();

        let handle = TunnelStateMachine::spawn(
            config.path().to_path_buf(),
            descriptor.as_raw_fd(),
            Arc::new(TrafficStats::new()),
            command_rx,
            event_tx,
            CancellationToken::new(),
        );

        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Starting)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::Failed(Error::Config(_))
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Stopped)
        ));

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_descriptor_fails_start() {
        let config = valid_config();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut events) = mpsc::unbounded_channel();

        let handle = TunnelStateMachine::spawn(
            config.path().to_path_buf(),
            -1,
            Arc::new(TrafficStats::new()),
            command_rx,
            event_tx,
            CancellationToken::new(),
        );

        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Starting)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::Failed(Error::Descriptor(_))
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Stopped)
        ));

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_token_stops_a_running_machine() {
        let config = valid_config();
        let (_keep_alive, descriptor) = descriptor_pair();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();

        let handle = TunnelStateMachine::spawn(
            config.path().to_path_buf(),
            descriptor.as_raw_fd(),
            Arc::new(TrafficStats::new()),
            command_rx,
            event_tx,
            shutdown_token.clone(),
        );

        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Starting)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Running)
        ));

        shutdown_token.cancel();
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Stopping)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TunnelEvent::NewState(TunnelState::Stopped)
        ));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("state machine did not finish")
            .unwrap();
    }
}
