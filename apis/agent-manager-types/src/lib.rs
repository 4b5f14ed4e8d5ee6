// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the agent manager and the agents it talks to.
//!
//! This crate contains the host record the manager reads and updates
//! through its store collaborator, the status and event vocabulary of the
//! host state machine, and the command/answer envelopes carried inside
//! wire frames. Nothing in here performs I/O.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString};

// ============================================================================
// Type Aliases
// ============================================================================

/// Host (and therefore agent) identifier
pub type HostId = u64;

/// Management server node identifier
pub type MsId = u64;

// ============================================================================
// Host Types
// ============================================================================

/// Connection status of a host, driven only by the host state machine.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum HostStatus {
    /// Record exists but no agent has ever connected
    Creating,
    /// Agent is connected and the handshake is in progress
    Connecting,
    /// Agent is connected and has acknowledged the ready command
    Up,
    /// Agent is not connected, the host is believed to be fine
    Disconnected,
    /// Agent is unreachable and its state could not be determined
    Alert,
    /// Host has been determined to be down
    Down,
    /// Host is being handed from one management server to another
    Rebalancing,
    /// Host was removed; terminal
    Removed,
    /// Host failed to initialize
    Error,
}

/// Events applied to the host state machine.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum HostEvent {
    AgentConnected,
    Ready,
    AgentDisconnected,
    PingTimeout,
    HostDown,
    ShutdownRequested,
    WaitedTooLong,
    StartAgentRebalance,
    RebalanceCompleted,
    RebalanceFailed,
    ManagementServerDown,
    /// Agent was heard from again
    Ping,
    Remove,
}

/// Kind of host. Determines how liveness failures are handled.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum HostType {
    /// Hypervisor host running guest VMs
    #[default]
    Routing,
    Storage,
    SecondaryStorage,
    /// System VM serving secondary storage
    SecondaryStorageVm,
    /// System VM serving consoles
    ConsoleProxy,
    ExternalLoadBalancer,
    ExternalFirewall,
}

impl HostType {
    /// System VMs that other hosts depend on. A liveness failure on one of
    /// these disconnects it immediately instead of probing it.
    pub fn is_infrastructure(self) -> bool {
        matches!(self, HostType::SecondaryStorageVm | HostType::ConsoleProxy)
    }

    /// Hosts that are themselves VMs and cannot be health-probed.
    pub fn is_virtual(self) -> bool {
        matches!(self, HostType::SecondaryStorageVm | HostType::ConsoleProxy)
    }
}

/// Administrative state of a host, independent of its connection status.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum ResourceState {
    Creating,
    #[default]
    Enabled,
    Disabled,
    PrepareForMaintenance,
    ErrorInMaintenance,
    Maintenance,
    Error,
}

impl ResourceState {
    /// True while the host is entering, in, or stuck in maintenance.
    pub fn is_maintenance(self) -> bool {
        matches!(
            self,
            ResourceState::PrepareForMaintenance
                | ResourceState::Maintenance
                | ResourceState::ErrorInMaintenance
        )
    }

    /// True when an operator has taken the host out of service.
    pub fn is_out_of_service(self) -> bool {
        matches!(
            self,
            ResourceState::Disabled
                | ResourceState::Maintenance
                | ResourceState::ErrorInMaintenance
        )
    }
}

/// The subset of a host record the agent manager reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Host identifier, also the agent identifier
    pub id: HostId,
    /// Display name
    pub name: String,
    /// Kind of host
    #[serde(default)]
    pub host_type: HostType,
    /// Connection status
    pub status: HostStatus,
    /// Administrative state
    #[serde(default)]
    pub resource_state: ResourceState,
    /// Management server that currently owns the agent connection
    #[serde(default)]
    pub owner: Option<MsId>,
    /// Last time the agent was heard from, in seconds since the epoch
    #[serde(default)]
    pub last_ping: i64,
    /// Zone the host lives in
    #[serde(default)]
    pub zone_id: u64,
    /// Pod the host lives in
    #[serde(default)]
    pub pod_id: Option<u64>,
    /// Cluster the host belongs to
    #[serde(default)]
    pub cluster_id: Option<u64>,
    /// Whether the manager drives this host in-process instead of the host
    /// connecting in over a socket
    #[serde(default)]
    pub direct: bool,
}

impl HostRecord {
    /// Create a record for a freshly discovered host.
    pub fn new(id: HostId, name: impl Into<String>, host_type: HostType) -> Self {
        HostRecord {
            id,
            name: name.into(),
            host_type,
            status: HostStatus::Creating,
            resource_state: ResourceState::Enabled,
            owner: None,
            last_ping: 0,
            zone_id: 0,
            pod_id: None,
            cluster_id: None,
            direct: false,
        }
    }
}

// ============================================================================
// Commands and Answers
// ============================================================================

/// Names of the commands the manager itself issues or interprets.
///
/// Everything else passing through the manager is opaque to it.
pub mod names {
    pub const STARTUP: &str = "Startup";
    pub const READY: &str = "Ready";
    pub const PING: &str = "Ping";
    pub const CHECK_HEALTH: &str = "CheckHealth";
    pub const SHUTDOWN: &str = "Shutdown";
    pub const MAINTAIN: &str = "Maintain";

    // Control commands exchanged between management servers.
    pub const CANCEL: &str = "Cancel";
    pub const CHANGE_AGENT: &str = "ChangeAgent";
    pub const TRANSFER_AGENT: &str = "TransferAgent";
    pub const PROPAGATE_RESOURCE_EVENT: &str = "PropagateResourceEvent";

    // Guest lifecycle commands referenced by the availability policy.
    pub const START: &str = "Start";
    pub const STOP: &str = "Stop";
    pub const CREATE: &str = "Create";
    pub const MIGRATE: &str = "Migrate";
    pub const CHECK_VIRTUAL_MACHINE: &str = "CheckVirtualMachine";
    pub const PING_TEST: &str = "PingTest";
    pub const SETUP: &str = "Setup";
    pub const CLEANUP_NETWORK_RULES: &str = "CleanupNetworkRules";
    pub const CHECK_NETWORK: &str = "CheckNetwork";
    pub const CHECK_ON_HOST: &str = "CheckOnHost";
    pub const MODIFY_TARGETS: &str = "ModifyTargets";
    pub const MODIFY_SSH_KEYS: &str = "ModifySshKeys";
    pub const MODIFY_STORAGE_POOL: &str = "ModifyStoragePool";
}

/// Commands still accepted by an agent that is in maintenance.
pub const DEFAULT_MAINTENANCE_ALLOWED: &[&str] = &[
    names::MAINTAIN,
    names::MIGRATE,
    names::STOP,
    names::CHECK_VIRTUAL_MACHINE,
    names::PING_TEST,
    names::CHECK_HEALTH,
    names::READY,
    names::SHUTDOWN,
    names::SETUP,
    names::CLEANUP_NETWORK_RULES,
    names::CHECK_NETWORK,
    names::CHECK_ON_HOST,
    names::MODIFY_TARGETS,
    names::MODIFY_SSH_KEYS,
    names::MODIFY_STORAGE_POOL,
];

/// Commands refused while an agent is still completing its handshake.
pub const DEFAULT_CONNECTING_DENIED: &[&str] = &[names::START, names::CREATE];

/// A single command destined for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name, used for policy decisions and dispatch
    pub name: String,
    /// Command body, opaque to the manager
    #[serde(default)]
    pub payload: Value,
    /// Seconds the caller is prepared to wait, 0 for the configured default
    #[serde(default)]
    pub wait_secs: u64,
    /// Must be answered before the next in-sequence request is sent
    #[serde(default)]
    pub in_sequence: bool,
    /// Repeat interval for commands run periodically on direct agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

impl Command {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Command {
            name: name.into(),
            payload,
            wait_secs: 0,
            in_sequence: false,
            interval_secs: None,
        }
    }

    /// Build a command carrying a typed payload.
    pub fn with_payload<T: Serialize>(
        name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Command::new(name, serde_json::to_value(payload)?))
    }

    pub fn in_sequence(mut self) -> Self {
        self.in_sequence = true;
        self
    }

    pub fn with_wait(mut self, wait_secs: u64) -> Self {
        self.wait_secs = wait_secs;
        self
    }

    /// Run this command every `interval_secs` on a direct agent.
    pub fn every(mut self, interval_secs: u64) -> Self {
        self.interval_secs = Some(interval_secs);
        self
    }

    /// Decode the payload into a typed structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn is_cron(&self) -> bool {
        self.interval_secs.is_some_and(|i| i > 0)
    }

    pub fn ready(host_id: HostId, ms_id: MsId) -> Self {
        Command::new(
            names::READY,
            serde_json::json!({ "host_id": host_id, "ms_id": ms_id }),
        )
    }

    pub fn check_health() -> Self {
        Command::new(names::CHECK_HEALTH, Value::Null)
    }

    pub fn ping() -> Self {
        Command::new(names::PING, Value::Null)
    }
}

/// The result of executing one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Name of the command this answers
    pub name: String,
    /// Whether the command succeeded
    pub result: bool,
    /// Human readable detail, usually the failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Answer body, opaque to the manager
    #[serde(default)]
    pub payload: Value,
}

impl Answer {
    pub fn success(cmd: &Command) -> Self {
        Answer {
            name: cmd.name.clone(),
            result: true,
            details: None,
            payload: Value::Null,
        }
    }

    pub fn failure(cmd: &Command, details: impl Into<String>) -> Self {
        Answer {
            name: cmd.name.clone(),
            result: false,
            details: Some(details.into()),
            payload: Value::Null,
        }
    }

    /// Answer for a command nobody on this side knows how to handle.
    pub fn unsupported(cmd: &Command) -> Self {
        Answer::failure(
            cmd,
            format!(
                "Unsupported command issued: {}. Are you sure you got the right type of server?",
                cmd.name
            ),
        )
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Decode the payload into a typed structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// An ordered batch of commands submitted together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commands {
    commands: Vec<Command>,
    /// Skip the rest of the batch after the first failed answer
    pub stop_on_error: bool,
}

impl Commands {
    pub fn new(commands: Vec<Command>) -> Self {
        Commands {
            commands,
            stop_on_error: false,
        }
    }

    pub fn single(cmd: Command) -> Self {
        Commands::new(vec![cmd])
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn push(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    pub fn as_slice(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// A batch is in-sequence if any one of its commands is.
    pub fn in_sequence(&self) -> bool {
        self.commands.iter().any(|c| c.in_sequence)
    }

    /// Longest per-command wait requested in this batch.
    pub fn max_wait_secs(&self) -> u64 {
        self.commands.iter().map(|c| c.wait_secs).max().unwrap_or(0)
    }

    pub fn into_vec(self) -> Vec<Command> {
        self.commands
    }
}

impl From<Vec<Command>> for Commands {
    fn from(commands: Vec<Command>) -> Self {
        Commands::new(commands)
    }
}

// ============================================================================
// Control Payloads
// ============================================================================

/// Body of the startup command an agent sends first on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupPayload {
    /// Host the agent runs on
    pub host_id: HostId,
    /// Agent software version
    #[serde(default)]
    pub version: String,
}

/// Body of the provisional acknowledgement to a startup command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupAck {
    pub host_id: HostId,
    /// How often the agent is expected to ping
    pub ping_interval_secs: u64,
}

/// Body of a shutdown command sent by an agent that is going away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    #[serde(default)]
    pub reason: String,
}

/// Cancel a forwarded request on the node holding the agent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPayload {
    pub seq: u64,
    pub reason: String,
}

/// Tell a peer that an agent's connection changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAgentPayload {
    pub host_id: HostId,
    pub event: HostEvent,
}

/// Which half of the ownership handoff a transfer command asks for.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum TransferPhase {
    /// Sent to the current owner: please give this agent up
    Request,
    /// Sent to the future owner: please load this agent now
    Start,
}

/// Move ownership of an agent between management servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAgentPayload {
    pub host_id: HostId,
    pub current_owner: MsId,
    pub future_owner: MsId,
    pub phase: TransferPhase,
}

/// Resource-level operations that must run on the agent's owner.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum ResourceEvent {
    EnterMaintenance,
    ExitMaintenance,
    Reconnect,
}

/// Ask the owning peer to apply a resource event to one of its agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagateResourceEventPayload {
    pub host_id: HostId,
    pub event: ResourceEvent,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn test_batch_in_sequence_if_any_command_is() {
        let mut cmds = Commands::single(Command::new(names::STOP, Value::Null));
        assert!(!cmds.in_sequence());
        cmds.push(Command::new(names::START, Value::Null).in_sequence());
        assert!(cmds.in_sequence());
    }

    #[test]
    fn test_batch_max_wait() {
        let cmds = Commands::new(vec![
            Command::new("a", Value::Null).with_wait(10),
            Command::new("b", Value::Null).with_wait(45),
            Command::new("c", Value::Null),
        ]);
        assert_eq!(cmds.max_wait_secs(), 45);
        assert_eq!(Commands::default().max_wait_secs(), 0);
    }

    #[test]
    fn test_cron_requires_positive_interval() {
        let cmd = Command::new("GetStats", Value::Null);
        assert!(!cmd.is_cron());
        assert!(!cmd.clone().every(0).is_cron());
        assert!(cmd.every(30).is_cron());
    }

    #[test]
    fn test_typed_payload() {
        let cancel = CancelPayload {
            seq: 42,
            reason: "Timed Out".to_string(),
        };
        let cmd = Command::with_payload(names::CANCEL, &cancel).unwrap();
        assert_eq!(cmd.payload_as::<CancelPayload>().unwrap(), cancel);
        assert!(cmd.payload_as::<TransferAgentPayload>().is_err());
    }

    #[test]
    fn test_unsupported_answer_names_command() {
        let cmd = Command::new("Frobnicate", Value::Null);
        let answer = Answer::unsupported(&cmd);
        assert!(!answer.result);
        assert!(answer.details.unwrap().contains("Frobnicate"));
    }

    #[test]
    fn test_command_defaults_when_fields_missing() {
        let cmd: Command = serde_json::from_str(r#"{"name":"Stop"}"#).unwrap();
        assert_eq!(cmd.payload, Value::Null);
        assert_eq!(cmd.wait_secs, 0);
        assert!(!cmd.in_sequence);
        assert_eq!(cmd.interval_secs, None);
    }

    #[test]
    fn test_host_type_classification() {
        assert!(HostType::ConsoleProxy.is_infrastructure());
        assert!(HostType::SecondaryStorageVm.is_virtual());
        assert!(!HostType::Routing.is_infrastructure());
        assert!(!HostType::Routing.is_virtual());
    }

    #[test]
    fn test_out_of_service_states() {
        assert!(ResourceState::Maintenance.is_out_of_service());
        assert!(ResourceState::Disabled.is_out_of_service());
        assert!(ResourceState::ErrorInMaintenance.is_out_of_service());
        assert!(!ResourceState::Enabled.is_out_of_service());
        assert!(!ResourceState::PrepareForMaintenance.is_out_of_service());
        assert!(ResourceState::PrepareForMaintenance.is_maintenance());
        assert!(!ResourceState::Disabled.is_maintenance());
    }

    #[test]
    fn test_status_parses_from_display() {
        assert_eq!(HostStatus::from_str("Rebalancing").unwrap(), HostStatus::Rebalancing);
        assert_eq!(HostEvent::PingTimeout.to_string(), "PingTimeout");
    }

    #[test]
    fn test_host_record_defaults_from_json() {
        let host: HostRecord =
            serde_json::from_str(r#"{"id":7,"name":"kvm-7","status":"Up"}"#).unwrap();
        assert_eq!(host.host_type, HostType::Routing);
        assert_eq!(host.resource_state, ResourceState::Enabled);
        assert_eq!(host.owner, None);
        assert!(!host.direct);
    }
}
