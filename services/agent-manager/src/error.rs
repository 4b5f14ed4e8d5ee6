// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Error types for the agent manager

use std::time::Duration;

use agent_manager_types::{Command, HostEvent, HostId, HostStatus, MsId};
use agent_wire::WireError;
use strum::{Display, IntoStaticStr};
use thiserror::Error;

/// Whether a synchronous send gave up on its first wait or after the one
/// extension granted to the request that was still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutKind {
    Hard,
    Soft,
}

/// Why a connect listener refused a new agent connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Setup failed; the host is disconnected towards Alert
    #[error("connection setup failed: {0}")]
    Setup(String),
    /// The listener declined the connection; the host is disconnected
    /// without alerting
    #[error("connection declined: {0}")]
    Declined(String),
}

/// Errors surfaced by the agent manager
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent {host_id} is unavailable: {reason}")]
    Unavailable { host_id: HostId, reason: String },

    #[error("Operation on agent {host_id} timed out ({kind}) after {wait:?}, seq {seq}")]
    TimedOut {
        host_id: HostId,
        seq: u64,
        wait: Duration,
        commands: Vec<Command>,
        kind: TimeoutKind,
    },

    #[error("Host {host_id} has no transition from {status} on {event}")]
    InvalidTransition {
        host_id: HostId,
        status: HostStatus,
        event: HostEvent,
    },

    #[error("Host {host_id}: {source}")]
    ConnectionSetup {
        host_id: HostId,
        #[source]
        source: ConnectionError,
    },

    #[error("Peer {peer} I/O failure: {reason}")]
    PeerIo { peer: MsId, reason: String },

    #[error("Host {0} not found")]
    HostNotFound(HostId),

    #[error("Host {host_id} is {status}, unable to {action}")]
    InvalidHostState {
        host_id: HostId,
        status: HostStatus,
        action: &'static str,
    },

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Host store error: {0}")]
    Store(String),
}

impl AgentError {
    pub fn unavailable(host_id: HostId, reason: impl Into<String>) -> Self {
        AgentError::Unavailable {
            host_id,
            reason: reason.into(),
        }
    }

    pub fn peer_io(peer: MsId, reason: impl ToString) -> Self {
        AgentError::PeerIo {
            peer,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
