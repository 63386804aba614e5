// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! SOCKS5 client side: method negotiation, CONNECT and UDP ASSOCIATE, plus
//! the datagram header codec for the UDP relay.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::config::Socks5Config;

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_USERPASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("failed to reach proxy at {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("proxy i/o failed")]
    Io(#[from] io::Error),

    #[error("timed out negotiating with the proxy")]
    Timeout,

    #[error("proxy speaks an unexpected protocol version {0:#04x}")]
    BadVersion(u8),

    #[error("proxy accepted none of the offered auth methods")]
    NoAcceptableAuth,

    #[error("proxy rejected the credentials")]
    AuthRejected,

    #[error("proxy rejected the request: {}", reject_reason(*.code))]
    Rejected { code: u8 },

    #[error("proxy returned an unsupported bound address type")]
    UnsupportedBoundAddress,

    #[error("malformed udp relay datagram")]
    MalformedUdpDatagram,
}

pub type Result<T, E = Socks5Error> = std::result::Result<T, E>;

fn reject_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "ttl expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Client for one upstream SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct Socks5Connector {
    server: SocketAddr,
    credentials: Option<(String, String)>,
}

impl Socks5Connector {
    pub fn new(server: SocketAddr, credentials: Option<(String, String)>) -> Self {
        Self {
            server,
            credentials,
        }
    }

    pub fn from_config(config: &Socks5Config) -> Self {
        Self::new(config.server_addr(), config.credentials())
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// CONNECT to `dst` through the proxy. On success the returned stream
    /// carries the end-to-end byte stream.
    pub async fn connect(&self, dst: SocketAddr) -> Result<TcpStream> {
        timeout(NEGOTIATION_TIMEOUT, self.connect_inner(dst))
            .await
            .map_err(|_| Socks5Error::Timeout)?
    }

    async fn connect_inner(&self, dst: SocketAddr) -> Result<TcpStream> {
        let mut stream = self.open().await?;
        self.request(&mut stream, CMD_CONNECT, dst).await?;
        debug!("socks5 connect established for {dst}");
        Ok(stream)
    }

    /// UDP ASSOCIATE. Returns the control connection (which must stay open
    /// for the association's lifetime) and the relay address datagrams go to.
    pub async fn udp_associate(&self) -> Result<(TcpStream, SocketAddr)> {
        timeout(NEGOTIATION_TIMEOUT, self.udp_associate_inner())
            .await
            .map_err(|_| Socks5Error::Timeout)?
    }

    async fn udp_associate_inner(&self) -> Result<(TcpStream, SocketAddr)> {
        let mut stream = self.open().await?;
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let mut relay = self.request(&mut stream, CMD_UDP_ASSOCIATE, unspecified).await?;
        // Some proxies answer with an unspecified bind address; datagrams
        // then go to the proxy host itself.
        if relay.ip().is_unspecified() {
            relay.set_ip(self.server.ip());
        }
        debug!("socks5 udp associate established, relay at {relay}");
        Ok((stream, relay))
    }

    async fn open(&self) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server)
            .await
            .map_err(|source| Socks5Error::Connect {
                addr: self.server,
                source,
            })?;
        stream.set_nodelay(true)?;
        self.handshake(&mut stream).await?;
        Ok(stream)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        let greeting: &[u8] = if self.credentials.is_some() {
            &[SOCKS_VERSION, 2, AUTH_NONE, AUTH_USERPASS]
        } else {
            &[SOCKS_VERSION, 1, AUTH_NONE]
        };
        stream.write_all(greeting).await?;

        let version = stream.read_u8().await?;
        if version != SOCKS_VERSION {
            return Err(Socks5Error::BadVersion(version));
        }
        match stream.read_u8().await? {
            AUTH_NONE => Ok(()),
            AUTH_USERPASS => match &self.credentials {
                Some((username, password)) => {
                    self.authenticate(stream, username, password).await
                }
                None => Err(Socks5Error::NoAcceptableAuth),
            },
            AUTH_NO_ACCEPTABLE => Err(Socks5Error::NoAcceptableAuth),
            _ => Err(Socks5Error::NoAcceptableAuth),
        }
    }

    async fn authenticate(
        &self,
        stream: &mut TcpStream,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let mut request = Vec::with_capacity(3 + username.len() + password.len());
        request.push(AUTH_USERPASS_VERSION);
        request.push(username.len() as u8);
        request.extend_from_slice(username.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        stream.write_all(&request).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(Socks5Error::AuthRejected);
        }
        Ok(())
    }

    async fn request(
        &self,
        stream: &mut TcpStream,
        command: u8,
        dst: SocketAddr,
    ) -> Result<SocketAddr> {
        let mut request = vec![SOCKS_VERSION, command, 0x00];
        encode_socket_addr(&mut request, dst);
        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(Socks5Error::BadVersion(header[0]));
        }
        if header[1] != 0x00 {
            return Err(Socks5Error::Rejected { code: header[1] });
        }

        let ip = match header[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(Socks5Error::UnsupportedBoundAddress),
        };
        let port = stream.read_u16().await?;
        Ok(SocketAddr::new(ip, port))
    }
}

fn encode_socket_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Prefix `payload` with the SOCKS5 UDP request header for `dst`.
pub fn encode_udp_request(dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(payload.len() + 22);
    datagram.extend_from_slice(&[0x00, 0x00, 0x00]); // reserved + fragment 0
    encode_socket_addr(&mut datagram, dst);
    datagram.extend_from_slice(payload);
    datagram
}

/// Strip the SOCKS5 UDP header from a relayed datagram, returning the origin
/// address and the payload.
pub fn decode_udp_reply(datagram: &[u8]) -> Result<(SocketAddr, &[u8])> {
    if datagram.len() < 4 || datagram[2] != 0x00 {
        // Fragmented relaying is never requested, so a fragment header is
        // treated as malformed.
        return Err(Socks5Error::MalformedUdpDatagram);
    }

    let (addr, consumed) = match datagram[3] {
        ATYP_IPV4 if datagram.len() >= 10 => {
            let octets: [u8; 4] = datagram[4..8]
                .try_into()
                .map_err(|_| Socks5Error::MalformedUdpDatagram)?;
            let port = u16::from_be_bytes([datagram[8], datagram[9]]);
            (SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port), 10)
        }
        ATYP_IPV6 if datagram.len() >= 22 => {
            let octets: [u8; 16] = datagram[4..20]
                .try_into()
                .map_err(|_| Socks5Error::MalformedUdpDatagram)?;
            let port = u16::from_be_bytes([datagram[20], datagram[21]]);
            (SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port), 22)
        }
        ATYP_DOMAIN => return Err(Socks5Error::UnsupportedBoundAddress),
        _ => return Err(Socks5Error::MalformedUdpDatagram),
    };
    Ok((addr, &datagram[consumed..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn connect_no_auth() {
        let (listener, addr) = listener().await;
        let (request_tx, request_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            request_tx.send((greeting.to_vec(), request.to_vec())).unwrap();

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            stream.write_all(b"pipe open").await.unwrap();
        });

        let connector = Socks5Connector::new(addr, None);
        let mut stream = connector
            .connect("93.184.216.34:80".parse().unwrap())
            .await
            .unwrap();

        let (greeting, request) = request_rx.await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        assert_eq!(
            request,
            [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0, 80]
        );

        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pipe open");
    }

    #[tokio::test]
    async fn connect_with_userpass() {
        let (listener, addr) = listener().await;
        let (auth_tx, auth_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 4];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x02]).await.unwrap();

            // 1 + 1 + "user" + 1 + "pass"
            let mut auth = [0u8; 11];
            stream.read_exact(&mut auth).await.unwrap();
            auth_tx.send(auth.to_vec()).unwrap();
            stream.write_all(&[0x01, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let connector =
            Socks5Connector::new(addr, Some(("user".to_string(), "pass".to_string())));
        connector
            .connect("1.1.1.1:443".parse().unwrap())
            .await
            .unwrap();

        let auth = auth_rx.await.unwrap();
        assert_eq!(auth[0], 0x01);
        assert_eq!(auth[1], 4);
        assert_eq!(&auth[2..6], b"user");
        assert_eq!(auth[6], 4);
        assert_eq!(&auth[7..11], b"pass");
    }

    #[tokio::test]
    async fn rejected_request_surfaces_reply_code() {
        let (listener, addr) = listener().await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let connector = Socks5Connector::new(addr, None);
        let err = connector
            .connect("10.9.8.7:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::Rejected { code: 0x05 }));
    }

    #[tokio::test]
    async fn udp_associate_fixes_up_unspecified_relay() {
        let (listener, addr) = listener().await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], 0x03);
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x27, 0x10])
                .await
                .unwrap();
            // Keep the control connection open until the client is done.
            let mut probe = [0u8; 1];
            let _ = stream.read(&mut probe).await;
        });

        let connector = Socks5Connector::new(addr, None);
        let (_control, relay) = connector.udp_associate().await.unwrap();
        assert_eq!(relay.ip(), addr.ip());
        assert_eq!(relay.port(), 10000);
    }

    #[test]
    fn udp_header_round_trip() {
        let dst: SocketAddr = "8.8.4.4:53".parse().unwrap();
        let datagram = encode_udp_request(dst, b"payload");
        assert_eq!(&datagram[..3], &[0, 0, 0]);

        let (addr, payload) = decode_udp_reply(&datagram).unwrap();
        assert_eq!(addr, dst);
        assert_eq!(payload, b"payload");

        let dst6: SocketAddr = "[2001:4860:4860::8844]:53".parse().unwrap();
        let datagram = encode_udp_request(dst6, b"x");
        let (addr, payload) = decode_udp_reply(&datagram).unwrap();
        assert_eq!(addr, dst6);
        assert_eq!(payload, b"x");
    }

    #[test]
    fn udp_decode_rejects_garbage() {
        assert!(decode_udp_reply(&[0, 0]).is_err());
        // Fragment bit set.
        assert!(decode_udp_reply(&[0, 0, 1, 1, 1, 2, 3, 4, 0, 53]).is_err());
        // Truncated v4 address.
        assert!(decode_udp_reply(&[0, 0, 0, 1, 1, 2]).is_err());
    }
}
