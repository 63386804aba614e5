// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[clap(author = "Nym Technologies SA", version, about)]
pub(crate) struct CliArgs {
    /// Path to the YAML config file (tunnel / socks5 / misc sections).
    #[arg(long)]
    pub config: PathBuf,

    /// Skip the root privilege check. Creating the TUN device will usually
    /// fail without it.
    #[arg(long)]
    pub skip_root_check: bool,
}
