// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! Per-flow upstream relay tasks. One task per flow, cancelled through the
//! flow's token; every exit path removes the flow from the session table.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UdpSocket,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    packet,
    session::{Flow, FlowKey, FlowMsg, SessionTable},
    socks5::{self, Socks5Connector},
    stack::{tcp::TcpFlowState, TunSink},
};

const MAX_DATAGRAM: usize = 65535;

pub(crate) struct RelayContext {
    pub connector: Socks5Connector,
    pub sink: TunSink,
    pub table: Arc<SessionTable>,
    /// Largest payload per segment toward the client.
    pub mss: usize,
}

pub(crate) async fn run_tcp_flow(
    ctx: Arc<RelayContext>,
    flow: Arc<Flow>,
    state: Arc<Mutex<TcpFlowState>>,
    mut rx: mpsc::Receiver<FlowMsg>,
) {
    let key = flow.key;
    info!("beginning {key}");

    let upstream = tokio::select! {
        _ = flow.cancel.cancelled() => {
            ctx.table.remove(&key).await;
            return;
        }
        result = ctx.connector.connect(key.dst) => {
            match result {
                Ok(stream) => stream,
                Err(err) => {
                    let err = Error::UpstreamUnreachable(err);
                    warn!("tearing down {key}: {err}");
                    abort_with_rst(&ctx, &flow, &state).await;
                    return;
                }
            }
        }
    };

    // The connection is admitted only once the upstream leg exists, so a
    // refused handshake turns into a reset instead of a half-open flow.
    let syn_ack = state.lock().syn_ack();
    ctx.sink.send_tcp(key, syn_ack, &[]).await;

    let (mut upstream_rx, mut upstream_tx) = upstream.into_split();
    let mut buf = vec![0u8; ctx.mss];
    let mut client_eof = false;
    let mut upstream_eof = false;

    loop {
        tokio::select! {
            _ = flow.cancel.cancelled() => break,
            msg = rx.recv(), if !client_eof => {
                match msg {
                    Some(FlowMsg::Data(data)) => {
                        flow.touch();
                        if let Err(err) = upstream_tx.write_all(&data).await {
                            debug!("upstream write failed for {key}: {err}");
                            let rst = state.lock().rst();
                            ctx.sink.send_tcp(key, rst, &[]).await;
                            break;
                        }
                    }
                    Some(FlowMsg::Eof) | None => {
                        client_eof = true;
                        let _ = upstream_tx.shutdown().await;
                        if upstream_eof {
                            break;
                        }
                    }
                }
            }
            read = upstream_rx.read(&mut buf), if !upstream_eof => {
                match read {
                    Ok(0) => {
                        upstream_eof = true;
                        let fin = state.lock().fin();
                        ctx.sink.send_tcp(key, fin, &[]).await;
                        if client_eof {
                            break;
                        }
                    }
                    Ok(n) => {
                        flow.touch();
                        let header = state.lock().next_data(n);
                        ctx.sink.send_tcp(key, header, &buf[..n]).await;
                    }
                    Err(err) => {
                        debug!("upstream read failed for {key}: {err}");
                        let rst = state.lock().rst();
                        ctx.sink.send_tcp(key, rst, &[]).await;
                        break;
                    }
                }
            }
        }
    }

    ctx.table.remove(&key).await;
    info!("ending {key}");
}

async fn abort_with_rst(ctx: &RelayContext, flow: &Flow, state: &Mutex<TcpFlowState>) {
    let rst = state.lock().rst();
    ctx.sink.send_tcp(flow.key, rst, &[]).await;
    ctx.table.remove(&flow.key).await;
}

pub(crate) async fn run_udp_flow(
    ctx: Arc<RelayContext>,
    flow: Arc<Flow>,
    mut rx: mpsc::Receiver<FlowMsg>,
) {
    let key = flow.key;
    debug!("beginning {key}");

    let (control, relay_addr) = tokio::select! {
        _ = flow.cancel.cancelled() => {
            ctx.table.remove(&key).await;
            return;
        }
        result = ctx.connector.udp_associate() => {
            match result {
                Ok(pair) => pair,
                Err(err) => {
                    let err = Error::UpstreamUnreachable(err);
                    warn!("tearing down {key}: {err}");
                    unreachable_response(&ctx, key).await;
                    return;
                }
            }
        }
    };

    let socket = match relay_socket(relay_addr).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!("failed to open udp relay socket for {key}: {err}");
            unreachable_response(&ctx, key).await;
            return;
        }
    };

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = flow.cancel.cancelled() => break,
            msg = rx.recv() => {
                match msg {
                    Some(FlowMsg::Data(payload)) => {
                        flow.touch();
                        let datagram = socks5::encode_udp_request(key.dst, &payload);
                        if let Err(err) = socket.send(&datagram).await {
                            debug!("udp relay send failed for {key}: {err}");
                            break;
                        }
                    }
                    Some(FlowMsg::Eof) | None => break,
                }
            }
            received = socket.recv(&mut buf) => {
                match received {
                    Ok(n) => {
                        flow.touch();
                        match socks5::decode_udp_reply(&buf[..n]) {
                            Ok((origin, payload)) => {
                                if let Some(reply) = packet::build_udp(origin, key.src, payload) {
                                    ctx.sink.send(&reply).await;
                                }
                            }
                            Err(err) => {
                                debug!("dropping malformed relay datagram for {key}: {err}");
                            }
                        }
                    }
                    Err(err) => {
                        debug!("udp relay socket failed for {key}: {err}");
                        break;
                    }
                }
            }
        }
    }

    // The association dies with the control connection.
    drop(control);
    ctx.table.remove(&key).await;
    debug!("ending {key}");
}

async fn relay_socket(relay_addr: SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr = if relay_addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(relay_addr).await?;
    Ok(socket)
}

async fn unreachable_response(ctx: &RelayContext, key: FlowKey) {
    if let Some(reply) = packet::build_icmp_port_unreachable(key.src, key.dst) {
        ctx.sink.send(&reply).await;
    }
    ctx.table.remove(&key).await;
}
