// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration")]
    Config(#[from] crate::config::ConfigError),

    #[error("the engine is already running")]
    AlreadyRunning,

    #[error("the engine is not running")]
    NotRunning,

    #[error("tun descriptor is invalid or closed")]
    Descriptor(#[source] std::io::Error),

    #[error("upstream socks5 proxy unreachable")]
    UpstreamUnreachable(#[source] crate::socks5::Socks5Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
