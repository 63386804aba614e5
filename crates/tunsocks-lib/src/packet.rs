// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! Raw IP packet parsing and synthesis for the userspace shim.
//!
//! Parsing leans on `pnet_packet` for the IP layer; the transport headers and
//! all reply packets are built by hand since the shim only ever emits plain
//! 20-byte TCP headers, UDP datagrams and ICMP unreachable messages.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::atomic::{AtomicU16, Ordering},
};

use pnet_packet::{
    ip::IpNextHeaderProtocols,
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    Packet,
};

static IP_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short")]
    Truncated,

    #[error("unsupported ip version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed {0} header")]
    Malformed(&'static str),
}

pub type Result<T, E = PacketError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn ack_only() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }

    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn rst_ack() -> Self {
        Self {
            rst: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn psh_ack() -> Self {
        Self {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= 0x01;
        }
        if self.syn {
            flags |= 0x02;
        }
        if self.rst {
            flags |= 0x04;
        }
        if self.psh {
            flags |= 0x08;
        }
        if self.ack {
            flags |= 0x10;
        }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum IpPacket {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    Unsupported { protocol: u8 },
}

pub fn parse(data: &[u8]) -> Result<IpPacket> {
    let version = data.first().ok_or(PacketError::Truncated)? >> 4;
    match version {
        4 => parse_v4(data),
        6 => parse_v6(data),
        other => Err(PacketError::UnsupportedVersion(other)),
    }
}

fn parse_v4(data: &[u8]) -> Result<IpPacket> {
    let packet = Ipv4Packet::new(data).ok_or(PacketError::Truncated)?;
    let src = IpAddr::V4(packet.get_source());
    let dst = IpAddr::V4(packet.get_destination());
    let protocol = packet.get_next_level_protocol();

    if protocol == IpNextHeaderProtocols::Tcp {
        parse_tcp(src, dst, packet.payload())
    } else if protocol == IpNextHeaderProtocols::Udp {
        parse_udp(src, dst, packet.payload())
    } else {
        Ok(IpPacket::Unsupported {
            protocol: protocol.0,
        })
    }
}

fn parse_v6(data: &[u8]) -> Result<IpPacket> {
    let packet = Ipv6Packet::new(data).ok_or(PacketError::Truncated)?;
    let src = IpAddr::V6(packet.get_source());
    let dst = IpAddr::V6(packet.get_destination());
    let protocol = packet.get_next_header();

    // Extension headers are not chased; flows behind them are dropped.
    if protocol == IpNextHeaderProtocols::Tcp {
        parse_tcp(src, dst, packet.payload())
    } else if protocol == IpNextHeaderProtocols::Udp {
        parse_udp(src, dst, packet.payload())
    } else {
        Ok(IpPacket::Unsupported {
            protocol: protocol.0,
        })
    }
}

fn parse_tcp(src_ip: IpAddr, dst_ip: IpAddr, data: &[u8]) -> Result<IpPacket> {
    if data.len() < 20 {
        return Err(PacketError::Truncated);
    }
    let data_offset = ((data[12] >> 4) as usize) * 4;
    if data_offset < 20 || data.len() < data_offset {
        return Err(PacketError::Malformed("tcp"));
    }

    Ok(IpPacket::Tcp(TcpSegment {
        src: SocketAddr::new(src_ip, u16::from_be_bytes([data[0], data[1]])),
        dst: SocketAddr::new(dst_ip, u16::from_be_bytes([data[2], data[3]])),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: TcpFlags::from_byte(data[13]),
        window: u16::from_be_bytes([data[14], data[15]]),
        payload: data[data_offset..].to_vec(),
    }))
}

fn parse_udp(src_ip: IpAddr, dst_ip: IpAddr, data: &[u8]) -> Result<IpPacket> {
    if data.len() < 8 {
        return Err(PacketError::Truncated);
    }

    Ok(IpPacket::Udp(UdpDatagram {
        src: SocketAddr::new(src_ip, u16::from_be_bytes([data[0], data[1]])),
        dst: SocketAddr::new(dst_ip, u16::from_be_bytes([data[2], data[3]])),
        payload: data[8..].to_vec(),
    }))
}

/// Build a TCP packet. `src`/`dst` must be the same address family.
pub fn build_tcp(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let mut tcp = vec![0u8; 20 + payload.len()];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags.to_byte();
    tcp[14..16].copy_from_slice(&window.to_be_bytes());
    tcp[20..].copy_from_slice(payload);

    let packet = wrap_ip(src.ip(), dst.ip(), 6, &mut tcp)?;
    Some(packet)
}

/// Build a UDP packet. `src`/`dst` must be the same address family.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_len = 8 + payload.len();
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[8..].copy_from_slice(payload);

    let packet = wrap_ip(src.ip(), dst.ip(), 17, &mut udp)?;
    Some(packet)
}

/// Build an ICMPv4 destination-unreachable (port unreachable) response for a
/// flow we could not relay. The embedded original header is reconstructed
/// from the flow addresses. IPv6 flows get no ICMP synthesis.
pub fn build_icmp_port_unreachable(src: SocketAddr, dst: SocketAddr) -> Option<Vec<u8>> {
    let (IpAddr::V4(orig_src), IpAddr::V4(orig_dst)) = (src.ip(), dst.ip()) else {
        return None;
    };

    // The original IPv4 header plus the first 8 bytes of the UDP datagram.
    let mut original = vec![0u8; 28];
    original[0] = 0x45;
    original[2..4].copy_from_slice(&28u16.to_be_bytes());
    original[8] = 64;
    original[9] = 17;
    original[12..16].copy_from_slice(&orig_src.octets());
    original[16..20].copy_from_slice(&orig_dst.octets());
    let header_cksum = internet_checksum(&original[..20]);
    original[10..12].copy_from_slice(&header_cksum.to_be_bytes());
    original[20..22].copy_from_slice(&src.port().to_be_bytes());
    original[22..24].copy_from_slice(&dst.port().to_be_bytes());
    original[24..26].copy_from_slice(&8u16.to_be_bytes());

    let mut icmp = vec![0u8; 8 + original.len()];
    icmp[0] = 3; // destination unreachable
    icmp[1] = 3; // port unreachable
    icmp[8..].copy_from_slice(&original);
    let icmp_cksum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&icmp_cksum.to_be_bytes());

    let mut packet = vec![0u8; 20 + icmp.len()];
    build_ipv4_header(&mut packet, orig_dst, orig_src, 1, icmp.len());
    packet[20..].copy_from_slice(&icmp);
    Some(packet)
}

fn wrap_ip(src: IpAddr, dst: IpAddr, protocol: u8, transport: &mut [u8]) -> Option<Vec<u8>> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let cksum =
                transport_checksum_v4(&src.octets(), &dst.octets(), protocol, transport);
            write_transport_checksum(protocol, transport, cksum);

            let mut packet = vec![0u8; 20 + transport.len()];
            build_ipv4_header(&mut packet, src, dst, protocol, transport.len());
            packet[20..].copy_from_slice(transport);
            Some(packet)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let cksum =
                transport_checksum_v6(&src.octets(), &dst.octets(), protocol, transport);
            write_transport_checksum(protocol, transport, cksum);

            let mut packet = vec![0u8; 40 + transport.len()];
            packet[0] = 0x60;
            packet[4..6].copy_from_slice(&(transport.len() as u16).to_be_bytes());
            packet[6] = protocol;
            packet[7] = 64;
            packet[8..24].copy_from_slice(&src.octets());
            packet[24..40].copy_from_slice(&dst.octets());
            packet[40..].copy_from_slice(transport);
            Some(packet)
        }
        _ => None,
    }
}

fn build_ipv4_header(packet: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) {
    let total_len = 20 + payload_len;
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    packet[4..6].copy_from_slice(&ip_id.to_be_bytes());
    packet[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    let cksum = internet_checksum(&packet[..20]);
    packet[10..12].copy_from_slice(&cksum.to_be_bytes());
}

fn write_transport_checksum(protocol: u8, transport: &mut [u8], cksum: u16) {
    match protocol {
        6 => transport[16..18].copy_from_slice(&cksum.to_be_bytes()),
        17 => {
            // An all-zero UDP checksum means "not computed".
            let cksum = if cksum == 0 { 0xFFFF } else { cksum };
            transport[6..8].copy_from_slice(&cksum.to_be_bytes());
        }
        _ => {}
    }
}

fn internet_checksum(data: &[u8]) -> u16 {
    ones_complement(sum_words(0, data))
}

fn transport_checksum_v4(src: &[u8; 4], dst: &[u8; 4], protocol: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum_words(sum, src);
    sum = sum_words(sum, dst);
    sum = sum.wrapping_add(protocol as u32);
    sum = sum.wrapping_add(data.len() as u32);
    ones_complement(sum_words(sum, data))
}

fn transport_checksum_v6(src: &[u8; 16], dst: &[u8; 16], protocol: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum_words(sum, src);
    sum = sum_words(sum, dst);
    sum = sum.wrapping_add(data.len() as u32);
    sum = sum.wrapping_add(protocol as u32);
    ones_complement(sum_words(sum, data))
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]]) as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

fn ones_complement(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}
