// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! Per-flow state, keyed by 5-tuple.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::stack::tcp::TcpFlowState;

pub(crate) const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Messages from the packet dispatcher to a flow's relay task.
#[derive(Debug)]
pub(crate) enum FlowMsg {
    Data(Bytes),
    Eof,
}

pub(crate) struct Flow {
    pub key: FlowKey,
    pub sender: mpsc::Sender<FlowMsg>,
    pub cancel: CancellationToken,
    pub tcp: Option<Arc<Mutex<TcpFlowState>>>,
    last_activity: Mutex<Instant>,
}

impl Flow {
    pub fn new(
        key: FlowKey,
        sender: mpsc::Sender<FlowMsg>,
        cancel: CancellationToken,
        tcp: Option<Arc<Mutex<TcpFlowState>>>,
    ) -> Self {
        Self {
            key,
            sender,
            cancel,
            tcp,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// All live flows. Creation and removal are serialized through the table
/// lock, so at most one flow exists per key even under concurrent packet
/// arrival.
pub(crate) struct SessionTable {
    flows: tokio::sync::Mutex<HashMap<FlowKey, Arc<Flow>>>,
    tcp_idle: Duration,
    udp_idle: Duration,
}

impl SessionTable {
    pub fn new(tcp_idle: Duration, udp_idle: Duration) -> Self {
        Self {
            flows: tokio::sync::Mutex::new(HashMap::new()),
            tcp_idle,
            udp_idle,
        }
    }

    pub async fn lookup(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.lock().await.get(key).cloned()
    }

    /// Insert `flow` unless a flow for the key is already present. Returns
    /// the flow now in the table and whether the given one was inserted.
    pub async fn lookup_or_create(&self, flow: Arc<Flow>) -> (Arc<Flow>, bool) {
        let mut flows = self.flows.lock().await;
        if let Some(existing) = flows.get(&flow.key) {
            (existing.clone(), false)
        } else {
            flows.insert(flow.key, flow.clone());
            (flow, true)
        }
    }

    pub async fn remove(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.flows.lock().await.len()
    }

    /// Evict flows idle beyond their protocol's window, cancelling their
    /// relay tasks so the upstream connection is released.
    pub async fn sweep_idle(&self) -> usize {
        let mut evicted = Vec::new();
        {
            let mut flows = self.flows.lock().await;
            flows.retain(|key, flow| {
                let window = match key.protocol {
                    Protocol::Tcp => self.tcp_idle,
                    Protocol::Udp => self.udp_idle,
                };
                if flow.idle_for() > window {
                    evicted.push(flow.clone());
                    false
                } else {
                    true
                }
            });
        }
        for flow in &evicted {
            debug!("evicting idle flow {}", flow.key);
            flow.cancel.cancel();
        }
        evicted.len()
    }

    /// Cancel and drop every flow. Used on shutdown.
    pub async fn drain(&self) {
        let flows: Vec<_> = {
            let mut flows = self.flows.lock().await;
            flows.drain().map(|(_, flow)| flow).collect()
        };
        trace!("draining {} flow(s)", flows.len());
        for flow in flows {
            flow.cancel.cancel();
        }
    }
}

/// Periodic idle sweep, one task per engine.
pub(crate) async fn run_sweeper(
    table: Arc<SessionTable>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let evicted = table.sweep_idle().await;
                if evicted > 0 {
                    debug!("idle sweep evicted {evicted} flow(s)");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(key: FlowKey) -> Arc<Flow> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Flow::new(key, tx, CancellationToken::new(), None))
    }

    fn key(port: u16) -> FlowKey {
        FlowKey {
            protocol: Protocol::Tcp,
            src: format!("10.0.0.2:{port}").parse().unwrap(),
            dst: "93.184.216.34:80".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn at_most_one_flow_per_key() {
        let table = Arc::new(SessionTable::new(TCP_IDLE_TIMEOUT, UDP_IDLE_TIMEOUT));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let (_, created) = table.lookup_or_create(flow(key(1000))).await;
                created
            }));
        }

        let mut created_count = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created_count += 1;
            }
        }
        assert_eq!(created_count, 1);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_flows_and_cancels_them() {
        let table = SessionTable::new(Duration::from_millis(10), Duration::from_millis(10));
        let (stale, _) = table.lookup_or_create(flow(key(1))).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (fresh, _) = table.lookup_or_create(flow(key(2))).await;

        assert_eq!(table.sweep_idle().await, 1);
        assert!(stale.cancel.is_cancelled());
        assert!(!fresh.cancel.is_cancelled());
        assert_eq!(table.len().await, 1);
        assert!(table.lookup(&key(2)).await.is_some());
    }

    #[tokio::test]
    async fn touch_keeps_a_flow_alive() {
        let table = SessionTable::new(Duration::from_millis(20), Duration::from_millis(20));
        let (flow, _) = table.lookup_or_create(flow(key(1))).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flow.touch();
            assert_eq!(table.sweep_idle().await, 0);
        }
    }

    #[tokio::test]
    async fn drain_cancels_everything() {
        let table = SessionTable::new(TCP_IDLE_TIMEOUT, UDP_IDLE_TIMEOUT);
        let (a, _) = table.lookup_or_create(flow(key(1))).await;
        let (b, _) = table.lookup_or_create(flow(key(2))).await;

        table.drain().await;
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert_eq!(table.len().await, 0);
    }
}
