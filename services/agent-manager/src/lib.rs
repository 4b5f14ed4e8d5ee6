// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent manager library
//!
//! The agent manager keeps an ordered request/response channel open to
//! every host agent owned by this management server, tracks host liveness
//! through the host status state machine, and, when several management
//! servers cooperate, forwards commands to whichever node owns an agent and
//! rebalances agent ownership between nodes.
//!
//! Layout:
//!
//! - [`attache`]: per-agent session holding sequencing and correlation state
//! - [`manager`]: single-node ownership table, handshake and disconnect policy
//! - [`cluster`]: peer forwarding and the rebalance protocol
//! - [`listener`] and [`sync_listener`]: observers of agent traffic

pub mod attache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod host;
pub mod listener;
pub mod manager;
pub mod metrics;
pub mod status;
pub mod sync_listener;
pub mod timer;

pub use error::{AgentError, Result};
pub use manager::AgentManager;
