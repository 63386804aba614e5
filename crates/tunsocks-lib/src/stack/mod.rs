// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! Packet dispatch: one reader task per TUN queue feeding the session table
//! and the per-flow relay tasks.

pub(crate) mod tcp;

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, trace, warn};

use crate::{
    config::{Config, UdpMode},
    error::Error,
    packet::{self, IpPacket, TcpFlags, TcpSegment, UdpDatagram},
    relay::{self, RelayContext},
    session::{
        self, Flow, FlowKey, FlowMsg, Protocol, SessionTable, SWEEP_INTERVAL, TCP_IDLE_TIMEOUT,
        UDP_IDLE_TIMEOUT,
    },
    socks5::Socks5Connector,
    stats::TrafficStats,
    stack::tcp::{Reply, TcpFlowState, RECV_WINDOW},
    tun::{TunDevice, TunQueue},
};

const MAX_PACKET: usize = 65535;
const FLOW_CHANNEL_CAPACITY: usize = 256;
const MIN_MSS: usize = 536;

/// Write side of the TUN device shared by the dispatcher and all flows.
#[derive(Clone)]
pub(crate) struct TunSink {
    queue: Arc<TunQueue>,
    stats: Arc<TrafficStats>,
}

impl TunSink {
    pub fn new(queue: Arc<TunQueue>, stats: Arc<TrafficStats>) -> Self {
        Self { queue, stats }
    }

    pub async fn send(&self, packet: &[u8]) {
        match self.queue.send(packet).await {
            Ok(n) => self.stats.record_out(n),
            Err(err) => debug!("tun write failed: {err}"),
        }
    }

    /// Inject a TCP segment for `key`, flipping the direction back toward
    /// the client.
    pub async fn send_tcp(&self, key: FlowKey, reply: Reply, payload: &[u8]) {
        if let Some(packet) = packet::build_tcp(
            key.dst,
            key.src,
            reply.seq,
            reply.ack,
            reply.flags,
            RECV_WINDOW,
            payload,
        ) {
            self.send(&packet).await;
        }
    }
}

/// Running engine: the dispatch tasks plus everything needed to stop them.
pub(crate) struct EngineHandle {
    pub cancel: CancellationToken,
    pub tasks: Vec<JoinHandle<()>>,
    pub table: Arc<SessionTable>,
    flow_tracker: TaskTracker,
}

impl EngineHandle {
    /// Cancel everything and wait for the tasks to finish, aborting whatever
    /// exceeds the grace period. No task survives this call.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        self.table.drain().await;

        self.flow_tracker.close();
        if timeout(grace, self.flow_tracker.wait()).await.is_err() {
            warn!("flow tasks did not stop within grace period");
        }

        let all_tasks = futures::future::join_all(self.tasks.iter_mut());
        if timeout(grace, all_tasks).await.is_err() {
            warn!("engine tasks did not stop within grace period, aborting");
            for task in &self.tasks {
                task.abort();
            }
        }
    }
}

pub(crate) struct TunStack {
    relay: Arc<RelayContext>,
    table: Arc<SessionTable>,
    stats: Arc<TrafficStats>,
    sink: TunSink,
    cancel: CancellationToken,
    udp_enabled: bool,
    fatal_tx: mpsc::Sender<Error>,
    flow_tracker: TaskTracker,
}

impl TunStack {
    /// Spawn the dispatch loops and the idle sweeper. The second return
    /// value delivers fatal engine errors (a dead descriptor).
    pub fn start(
        config: &Config,
        device: TunDevice,
        stats: Arc<TrafficStats>,
    ) -> (EngineHandle, mpsc::Receiver<Error>) {
        let cancel = CancellationToken::new();
        let table = Arc::new(SessionTable::new(TCP_IDLE_TIMEOUT, UDP_IDLE_TIMEOUT));
        let sink = TunSink::new(device.primary(), stats.clone());
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let flow_tracker = TaskTracker::new();

        let relay = Arc::new(RelayContext {
            connector: Socks5Connector::from_config(&config.socks5),
            sink: sink.clone(),
            table: table.clone(),
            mss: (config.tunnel.mtu as usize).saturating_sub(40).max(MIN_MSS),
        });

        let stack = Arc::new(Self {
            relay,
            table: table.clone(),
            stats,
            sink,
            cancel: cancel.clone(),
            udp_enabled: config.socks5.udp == UdpMode::Udp,
            fatal_tx,
            flow_tracker: flow_tracker.clone(),
        });

        let mut tasks = Vec::new();
        for queue in device.queues() {
            tasks.push(tokio::spawn(stack.clone().run_queue(queue.clone())));
        }
        tasks.push(tokio::spawn(session::run_sweeper(
            table.clone(),
            SWEEP_INTERVAL,
            cancel.clone(),
        )));

        (
            EngineHandle {
                cancel,
                tasks,
                table,
                flow_tracker,
            },
            fatal_rx,
        )
    }

    async fn run_queue(self: Arc<Self>, queue: Arc<TunQueue>) {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = queue.recv(&mut buf) => {
                    match result {
                        Ok(0) => continue,
                        Ok(n) => {
                            self.stats.record_in(n);
                            self.handle_packet(&buf[..n]).await;
                        }
                        Err(err) => {
                            error!("tun read failed: {err}");
                            let _ = self.fatal_tx.try_send(Error::Descriptor(err));
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, data: &[u8]) {
        match packet::parse(data) {
            Ok(IpPacket::Tcp(segment)) => self.handle_tcp_segment(segment).await,
            Ok(IpPacket::Udp(datagram)) => self.handle_udp_datagram(datagram).await,
            Ok(IpPacket::Unsupported { protocol }) => {
                trace!("dropping packet with ip protocol {protocol}");
            }
            Err(err) => trace!("dropping unparseable packet: {err}"),
        }
    }

    async fn handle_tcp_segment(self: &Arc<Self>, segment: TcpSegment) {
        let key = FlowKey {
            protocol: Protocol::Tcp,
            src: segment.src,
            dst: segment.dst,
        };

        if let Some(flow) = self.table.lookup(&key).await {
            let Some(state) = flow.tcp.clone() else {
                return;
            };
            flow.touch();
            let outcome = state.lock().on_segment(&segment);
            for reply in &outcome.replies {
                self.sink.send_tcp(key, *reply, &[]).await;
            }
            if let Some(data) = outcome.deliver {
                if flow.sender.send(FlowMsg::Data(data.into())).await.is_err() {
                    trace!("flow task gone for {key}");
                }
            }
            if outcome.client_eof {
                let _ = flow.sender.send(FlowMsg::Eof).await;
            }
            if outcome.closed {
                if let Some(flow) = self.table.remove(&key).await {
                    flow.cancel.cancel();
                }
            }
            return;
        }

        if segment.flags.syn && !segment.flags.ack {
            let state = Arc::new(Mutex::new(TcpFlowState::new(segment.seq)));
            let (sender, receiver) = mpsc::channel(FLOW_CHANNEL_CAPACITY);
            let candidate = Arc::new(Flow::new(
                key,
                sender,
                self.cancel.child_token(),
                Some(state.clone()),
            ));
            let (flow, created) = self.table.lookup_or_create(candidate).await;
            if created {
                debug!("accepted {key}");
                self.flow_tracker.spawn(relay::run_tcp_flow(
                    self.relay.clone(),
                    flow,
                    state,
                    receiver,
                ));
            }
            return;
        }

        // Segments for flows we no longer track. Bare control segments are
        // late acks/fins from a torn-down flow and are ignored; anything
        // still carrying data gets a reset.
        if !segment.payload.is_empty() {
            let reply = Reply {
                flags: TcpFlags::rst_ack(),
                seq: segment.ack,
                ack: segment.seq.wrapping_add(segment.payload.len() as u32),
            };
            self.sink.send_tcp(key, reply, &[]).await;
        }
    }

    async fn handle_udp_datagram(self: &Arc<Self>, datagram: UdpDatagram) {
        if !self.udp_enabled {
            trace!("udp relay disabled, dropping datagram");
            return;
        }

        let key = FlowKey {
            protocol: Protocol::Udp,
            src: datagram.src,
            dst: datagram.dst,
        };

        let (sender, receiver) = mpsc::channel(FLOW_CHANNEL_CAPACITY);
        let candidate = Arc::new(Flow::new(key, sender, self.cancel.child_token(), None));
        let (flow, created) = self.table.lookup_or_create(candidate).await;
        if created {
            debug!("accepted {key}");
            self.flow_tracker
                .spawn(relay::run_udp_flow(self.relay.clone(), flow.clone(), receiver));
        }

        flow.touch();
        if flow
            .sender
            .send(FlowMsg::Data(datagram.payload.into()))
            .await
            .is_err()
        {
            trace!("flow task gone for {key}");
        }
    }
}
