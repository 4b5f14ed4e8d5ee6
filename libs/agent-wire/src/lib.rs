// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Binary framing for agent and inter-node traffic.
//!
//! Every frame is a fixed 33 byte big-endian header followed by a JSON
//! array body:
//!
//! ```text
//!  0       1       3               11              19              27      31  33
//!  +-------+-------+---------------+---------------+---------------+-------+---+----
//!  |version| flags |   origin ms   |    agent id   |   sequence    |  len  |crc| body
//!  +-------+-------+---------------+---------------+---------------+-------+---+----
//! ```
//!
//! The body holds the commands of a request or the answers of a response.
//! The checksum is CRC-16/ARC over the body bytes. A control frame carries
//! exactly one command or answer.
//!
//! [`AgentCodec`] implements the tokio-util `Decoder` and `Encoder` traits so
//! a socket can be wrapped with `AgentCodec::default().framed(stream)`.

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::AgentCodec;
pub use error::WireError;
pub use frame::{Frame, Request, Response};
