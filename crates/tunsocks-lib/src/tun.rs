// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! Async access to an already-open TUN descriptor.
//!
//! The embedding application owns the virtual interface; we only get its file
//! descriptor. The descriptor is duplicated so the embedder keeps control of
//! the original, switched to non-blocking mode and driven through tokio's
//! `AsyncFd` so reads stay cancellable.

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Arc,
};

use tokio::io::unix::AsyncFd;
use tracing::{info, warn};

/// One readable/writable TUN queue.
pub struct TunQueue {
    inner: AsyncFd<OwnedFd>,
}

impl TunQueue {
    /// Wrap a raw descriptor handed to us across the boundary. The descriptor
    /// is duplicated; the caller keeps ownership of the original.
    pub fn from_raw_fd(raw: RawFd) -> io::Result<Self> {
        if raw < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "negative tun descriptor",
            ));
        }
        let duplicate = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) };
        if duplicate < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(duplicate) };
        Self::from_owned_fd(owned)
    }

    fn from_owned_fd(owned: OwnedFd) -> io::Result<Self> {
        set_nonblocking(owned.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(owned)?,
        })
    }

    /// Read a single packet from the queue.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(
                        fd.get_ref().as_raw_fd(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Inject a single packet into the interface. One write syscall per
    /// packet keeps concurrent writers from interleaving.
    pub async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(
                        fd.get_ref().as_raw_fd(),
                        packet.as_ptr().cast(),
                        packet.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The TUN device as seen by the engine: one or more queues over the same
/// interface.
pub struct TunDevice {
    queues: Vec<Arc<TunQueue>>,
}

impl TunDevice {
    /// Build the device from the descriptor supplied by the embedder. When
    /// more than one queue is requested, the extra queues are attached by
    /// interface name; failure to attach is not fatal, the engine just runs
    /// with fewer queues.
    pub fn from_descriptor(raw: RawFd, name: &str, requested_queues: u16) -> io::Result<Self> {
        let mut queues = vec![Arc::new(TunQueue::from_raw_fd(raw)?)];

        for _ in 1..requested_queues {
            match open_queue(name) {
                Ok(owned) => match TunQueue::from_owned_fd(owned) {
                    Ok(queue) => queues.push(Arc::new(queue)),
                    Err(err) => {
                        warn!("failed to register extra tun queue: {err}");
                        break;
                    }
                },
                Err(err) => {
                    warn!("failed to attach queue to {name}: {err}");
                    break;
                }
            }
        }

        info!("tun device ready with {} queue(s)", queues.len());
        Ok(Self { queues })
    }

    pub fn queues(&self) -> &[Arc<TunQueue>] {
        &self.queues
    }

    pub fn primary(&self) -> Arc<TunQueue> {
        self.queues[0].clone()
    }
}

/// Attach another queue to a multi-queue interface by name.
#[cfg(target_os = "linux")]
fn open_queue(name: &str) -> io::Result<OwnedFd> {
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;
    const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    if name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }

    let fd = unsafe {
        libc::open(
            c"/dev/net/tun".as_ptr(),
            libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut request = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TUN | IFF_NO_PI | IFF_MULTI_QUEUE,
        _pad: [0; 22],
    };
    for (slot, byte) in request.name.iter_mut().zip(name.as_bytes()) {
        *slot = *byte as libc::c_char;
    }

    if unsafe { libc::ioctl(owned.as_raw_fd(), TUNSETIFF, &request) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(owned)
}

#[cfg(not(target_os = "linux"))]
fn open_queue(_name: &str) -> io::Result<OwnedFd> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "multi-queue attach requires linux",
    ))
}
