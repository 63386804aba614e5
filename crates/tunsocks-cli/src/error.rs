// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("{binary_name} must run as root to create the tun device")]
    RootPrivilegesRequired { binary_name: String },

    #[error("failed to create tun device")]
    CreateTunDevice(#[from] tun::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
