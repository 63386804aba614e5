// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: GPL-3.0-only

//! tunsocks: a SOCKS5-over-TUN relay engine.
//!
//! The embedding application opens a virtual network interface and an
//! upstream SOCKS5 proxy is reachable somewhere; this library owns everything
//! in between. Raw IP packets read from the interface descriptor are
//! terminated in a compact userspace shim, each 5-tuple becomes a flow with
//! one upstream SOCKS5 connection (CONNECT for TCP, UDP ASSOCIATE for UDP),
//! and bytes are relayed both ways until either side closes or the flow goes
//! idle.
//!
//! Embedders use the [`platform`] module (or its C ABI in
//! [`platform::ffi`]): `start(config_path, descriptor)`, `stop()`,
//! `get_stats()`, with unrecoverable failures delivered through a callback.
//! Hosts that already run their own tokio runtime can drive the
//! [`state_machine`] directly instead.

pub mod config;
pub mod error;
mod packet;
pub mod platform;
mod relay;
mod session;
mod socks5;
mod stack;
pub mod state_machine;
mod stats;
mod tun;

pub use config::Config;
pub use error::Error;
pub use session::{FlowKey, Protocol};
pub use socks5::Socks5Error;
pub use stats::{TrafficSnapshot, TrafficStats};
