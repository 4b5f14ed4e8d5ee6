// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! In-memory form of the frames carried by [`crate::AgentCodec`].

use agent_manager_types::{Answer, Command, Commands, HostId, MsId};

/// A batch of commands for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Per-agent sequence number, used to correlate the response
    pub seq: u64,
    /// Agent the commands are for
    pub agent_id: HostId,
    /// Management server the request originated on
    pub mgmt_id: MsId,
    /// Must be answered before the next in-sequence request is sent
    pub in_sequence: bool,
    /// Stop executing the batch at the first failed answer
    pub stop_on_error: bool,
    /// Node-to-node control request carrying a single command
    pub control: bool,
    /// Already relayed once between management servers
    pub forwarded: bool,
    pub commands: Vec<Command>,
}

impl Request {
    pub fn new(agent_id: HostId, mgmt_id: MsId, seq: u64, commands: Commands) -> Self {
        Request {
            seq,
            agent_id,
            mgmt_id,
            in_sequence: commands.in_sequence(),
            stop_on_error: commands.stop_on_error,
            control: false,
            forwarded: false,
            commands: commands.into_vec(),
        }
    }

    /// A control request with exactly one command.
    pub fn control(agent_id: HostId, mgmt_id: MsId, seq: u64, command: Command) -> Self {
        Request {
            seq,
            agent_id,
            mgmt_id,
            in_sequence: false,
            stop_on_error: false,
            control: true,
            forwarded: false,
            commands: vec![command],
        }
    }

    /// Name of the first command, which identifies control requests.
    pub fn first_command(&self) -> Option<&Command> {
        self.commands.first()
    }

    pub fn is_cron(&self) -> bool {
        self.commands.first().is_some_and(Command::is_cron)
    }
}

/// Answers to a [`Request`], matched 1:1 with its commands.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub seq: u64,
    pub agent_id: HostId,
    /// Management server the original request came from
    pub mgmt_id: MsId,
    /// Copied from the request so the receiver can advance its queue
    pub in_sequence: bool,
    pub control: bool,
    pub answers: Vec<Answer>,
}

impl Response {
    pub fn for_request(req: &Request, answers: Vec<Answer>) -> Self {
        Response {
            seq: req.seq,
            agent_id: req.agent_id,
            mgmt_id: req.mgmt_id,
            in_sequence: req.in_sequence,
            control: req.control,
            answers,
        }
    }

    /// The single answer of a control response.
    pub fn answer(&self) -> Option<&Answer> {
        self.answers.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    pub fn seq(&self) -> u64 {
        match self {
            Frame::Request(r) => r.seq,
            Frame::Response(r) => r.seq,
        }
    }

    pub fn agent_id(&self) -> HostId {
        match self {
            Frame::Request(r) => r.agent_id,
            Frame::Response(r) => r.agent_id,
        }
    }

    pub fn mgmt_id(&self) -> MsId {
        match self {
            Frame::Request(r) => r.mgmt_id,
            Frame::Response(r) => r.mgmt_id,
        }
    }

    pub fn is_control(&self) -> bool {
        match self {
            Frame::Request(r) => r.control,
            Frame::Response(r) => r.control,
        }
    }
}

impl From<Request> for Frame {
    fn from(req: Request) -> Self {
        Frame::Request(req)
    }
}

impl From<Response> for Frame {
    fn from(resp: Response) -> Self {
        Frame::Response(resp)
    }
}
