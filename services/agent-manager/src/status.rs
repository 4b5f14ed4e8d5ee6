// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Host status state machine
//!
//! Every status change goes through [`transition`]. A pair with no entry in
//! the table is refused with [`AgentError::InvalidTransition`]; there is no
//! fallback status.

use agent_manager_types::{HostEvent, HostId, HostStatus, MsId};

use crate::error::{AgentError, Result};

/// Look up the status `event` moves a host in `current` to.
pub fn next_status(current: HostStatus, event: HostEvent) -> Option<HostStatus> {
    use HostEvent as E;
    use HostStatus as S;

    let next = match (current, event) {
        (S::Creating, E::AgentConnected) => S::Connecting,

        (S::Connecting, E::AgentConnected) => S::Connecting,
        (S::Connecting, E::Ready) => S::Up,
        (S::Connecting, E::PingTimeout) => S::Alert,
        (S::Connecting, E::AgentDisconnected) => S::Alert,
        (S::Connecting, E::ShutdownRequested) => S::Disconnected,
        (S::Connecting, E::HostDown) => S::Down,
        (S::Connecting, E::Ping) => S::Connecting,
        (S::Connecting, E::ManagementServerDown) => S::Disconnected,
        (S::Connecting, E::StartAgentRebalance) => S::Rebalancing,

        (S::Up, E::AgentConnected) => S::Connecting,
        (S::Up, E::Ping) => S::Up,
        (S::Up, E::PingTimeout) => S::Alert,
        (S::Up, E::AgentDisconnected) => S::Alert,
        (S::Up, E::ShutdownRequested) => S::Disconnected,
        (S::Up, E::HostDown) => S::Down,
        (S::Up, E::ManagementServerDown) => S::Disconnected,
        (S::Up, E::StartAgentRebalance) => S::Rebalancing,
        (S::Up, E::Remove) => S::Removed,

        (S::Disconnected, E::AgentConnected) => S::Connecting,
        (S::Disconnected, E::Ping) => S::Up,
        (S::Disconnected, E::PingTimeout) => S::Alert,
        (S::Disconnected, E::AgentDisconnected) => S::Disconnected,
        (S::Disconnected, E::ShutdownRequested) => S::Disconnected,
        (S::Disconnected, E::HostDown) => S::Down,
        (S::Disconnected, E::WaitedTooLong) => S::Alert,
        (S::Disconnected, E::ManagementServerDown) => S::Disconnected,
        (S::Disconnected, E::Remove) => S::Removed,

        (S::Alert, E::AgentConnected) => S::Connecting,
        (S::Alert, E::Ping) => S::Up,
        (S::Alert, E::PingTimeout) => S::Alert,
        (S::Alert, E::AgentDisconnected) => S::Alert,
        (S::Alert, E::ShutdownRequested) => S::Disconnected,
        (S::Alert, E::HostDown) => S::Down,
        (S::Alert, E::ManagementServerDown) => S::Alert,
        (S::Alert, E::Remove) => S::Removed,

        (S::Down, E::AgentConnected) => S::Connecting,
        (S::Down, E::Ping) => S::Up,
        (S::Down, E::PingTimeout) => S::Down,
        (S::Down, E::AgentDisconnected) => S::Down,
        (S::Down, E::HostDown) => S::Down,
        (S::Down, E::ShutdownRequested) => S::Disconnected,
        (S::Down, E::ManagementServerDown) => S::Down,
        (S::Down, E::Remove) => S::Removed,

        (S::Rebalancing, E::RebalanceCompleted) => S::Connecting,
        (S::Rebalancing, E::RebalanceFailed) => S::Disconnected,
        (S::Rebalancing, E::AgentConnected) => S::Connecting,
        (S::Rebalancing, E::AgentDisconnected) => S::Disconnected,
        (S::Rebalancing, E::ShutdownRequested) => S::Disconnected,
        (S::Rebalancing, E::ManagementServerDown) => S::Disconnected,
        (S::Rebalancing, E::Ping) => S::Rebalancing,

        (S::Error, E::AgentConnected) => S::Connecting,
        (S::Error, E::Remove) => S::Removed,

        _ => return None,
    };
    Some(next)
}

/// Apply `event` to a host in `current`, refusing undefined transitions.
pub fn transition(host_id: HostId, current: HostStatus, event: HostEvent) -> Result<HostStatus> {
    next_status(current, event).ok_or(AgentError::InvalidTransition {
        host_id,
        status: current,
        event,
    })
}

/// Owner a host record should carry once it reaches `status`.
///
/// The node driving a host into a connected state records itself; every
/// other status leaves the host unowned.
pub fn owner_after(status: HostStatus, ms_id: MsId) -> Option<MsId> {
    match status {
        HostStatus::Connecting | HostStatus::Up | HostStatus::Rebalancing => Some(ms_id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use HostEvent as E;
    use HostStatus as S;
    use strum::IntoEnumIterator;
    use test_case::test_case;

    #[test_case(S::Connecting, E::Ready, S::Up; "handshake completes")]
    #[test_case(S::Up, E::PingTimeout, S::Alert; "missed pings")]
    #[test_case(S::Disconnected, E::WaitedTooLong, S::Alert; "grace expired")]
    #[test_case(S::Alert, E::Ping, S::Up; "recovered by ping")]
    #[test_case(S::Up, E::StartAgentRebalance, S::Rebalancing; "rebalance begins")]
    #[test_case(S::Rebalancing, E::RebalanceFailed, S::Disconnected; "rebalance fails")]
    #[test_case(S::Rebalancing, E::RebalanceCompleted, S::Connecting; "rebalance completes")]
    #[test_case(S::Alert, E::ManagementServerDown, S::Alert; "alert survives peer loss")]
    fn test_defined_transitions(from: HostStatus, event: HostEvent, to: HostStatus) {
        assert_eq!(transition(1, from, event).unwrap(), to);
    }

    #[test]
    fn test_undefined_transition_is_refused() {
        let err = transition(42, S::Up, E::Ready).unwrap_err();
        match err {
            AgentError::InvalidTransition {
                host_id,
                status,
                event,
            } => {
                assert_eq!(host_id, 42);
                assert_eq!(status, S::Up);
                assert_eq!(event, E::Ready);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_removed_is_terminal() {
        for event in HostEvent::iter() {
            assert_eq!(next_status(S::Removed, event), None, "{event}");
        }
    }

    #[test]
    fn test_rebalancing_only_entered_from_connected_states() {
        for status in HostStatus::iter() {
            let entered = next_status(status, E::StartAgentRebalance) == Some(S::Rebalancing);
            assert_eq!(entered, matches!(status, S::Up | S::Connecting), "{status}");
        }
    }

    #[test]
    fn test_owner_follows_status() {
        assert_eq!(owner_after(S::Up, 3), Some(3));
        assert_eq!(owner_after(S::Rebalancing, 3), Some(3));
        assert_eq!(owner_after(S::Disconnected, 3), None);
        assert_eq!(owner_after(S::Alert, 3), None);
    }
}
