// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use crc16::{ARC, State};
use tokio_util::codec::{Decoder, Encoder};

use agent_manager_types::{Answer, Command};

use crate::error::WireError;
use crate::frame::{Frame, Request, Response};

/// Current frame version.
pub const VERSION: u8 = 1;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 33;

/// Largest body accepted unless configured otherwise.
pub const DEFAULT_MAX_BODY: usize = 16 * 1024 * 1024;

const FLAG_REQUEST: u16 = 0x0001;
const FLAG_CONTROL: u16 = 0x0002;
const FLAG_IN_SEQUENCE: u16 = 0x0004;
const FLAG_STOP_ON_ERROR: u16 = 0x0008;
const FLAG_FORWARDED: u16 = 0x0010;

// Header field offsets.
const OFF_VERSION: usize = 0;
const OFF_FLAGS: usize = 1;
const OFF_MGMT: usize = 3;
const OFF_AGENT: usize = 11;
const OFF_SEQ: usize = 19;
const OFF_LEN: usize = 27;
const OFF_CRC: usize = 31;

/// Codec for [`Frame`]s.
#[derive(Debug, Clone)]
pub struct AgentCodec {
    max_body: usize,
}

impl Default for AgentCodec {
    fn default() -> Self {
        AgentCodec {
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

impl AgentCodec {
    pub fn with_max_body(max_body: usize) -> Self {
        AgentCodec { max_body }
    }
}

fn flags_of(frame: &Frame) -> u16 {
    let mut flags = 0;
    let (control, in_sequence) = match frame {
        Frame::Request(r) => {
            flags |= FLAG_REQUEST;
            if r.stop_on_error {
                flags |= FLAG_STOP_ON_ERROR;
            }
            if r.forwarded {
                flags |= FLAG_FORWARDED;
            }
            (r.control, r.in_sequence)
        }
        Frame::Response(r) => (r.control, r.in_sequence),
    };
    if control {
        flags |= FLAG_CONTROL;
    }
    if in_sequence {
        flags |= FLAG_IN_SEQUENCE;
    }
    flags
}

impl Decoder for AgentCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = buf[OFF_VERSION];
        if version != VERSION {
            return Err(WireError::VersionMismatch {
                found: version,
                expected: VERSION,
            });
        }

        let len = BigEndian::read_u32(&buf[OFF_LEN..OFF_CRC]) as usize;
        if len > self.max_body {
            return Err(WireError::PayloadTooLarge {
                len,
                max: self.max_body,
            });
        }

        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(HEADER_LEN + len);
        let flags = BigEndian::read_u16(&frame[OFF_FLAGS..OFF_MGMT]);
        let mgmt_id = BigEndian::read_u64(&frame[OFF_MGMT..OFF_AGENT]);
        let agent_id = BigEndian::read_u64(&frame[OFF_AGENT..OFF_SEQ]);
        let seq = BigEndian::read_u64(&frame[OFF_SEQ..OFF_LEN]);
        let expected = BigEndian::read_u16(&frame[OFF_CRC..HEADER_LEN]);

        let body = &frame[HEADER_LEN..];
        let actual = State::<ARC>::calculate(body);
        if actual != expected {
            return Err(WireError::ChecksumMismatch { expected, actual });
        }

        let control = flags & FLAG_CONTROL != 0;
        let in_sequence = flags & FLAG_IN_SEQUENCE != 0;

        if flags & FLAG_REQUEST != 0 {
            let commands: Vec<Command> = serde_json::from_slice(body)?;
            if control && commands.len() != 1 {
                return Err(WireError::InvalidControl(commands.len()));
            }
            Ok(Some(Frame::Request(Request {
                seq,
                agent_id,
                mgmt_id,
                in_sequence,
                stop_on_error: flags & FLAG_STOP_ON_ERROR != 0,
                control,
                forwarded: flags & FLAG_FORWARDED != 0,
                commands,
            })))
        } else {
            let answers: Vec<Answer> = serde_json::from_slice(body)?;
            if control && answers.len() != 1 {
                return Err(WireError::InvalidControl(answers.len()));
            }
            Ok(Some(Frame::Response(Response {
                seq,
                agent_id,
                mgmt_id,
                in_sequence,
                control,
                answers,
            })))
        }
    }
}

impl Encoder<Frame> for AgentCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), WireError> {
        let body = match &frame {
            Frame::Request(r) => {
                if r.control && r.commands.len() != 1 {
                    return Err(WireError::InvalidControl(r.commands.len()));
                }
                serde_json::to_vec(&r.commands)?
            }
            Frame::Response(r) => {
                if r.control && r.answers.len() != 1 {
                    return Err(WireError::InvalidControl(r.answers.len()));
                }
                serde_json::to_vec(&r.answers)?
            }
        };

        if body.len() > self.max_body {
            return Err(WireError::PayloadTooLarge {
                len: body.len(),
                max: self.max_body,
            });
        }

        buf.reserve(HEADER_LEN + body.len());
        buf.put_u8(VERSION);
        buf.put_u16(flags_of(&frame));
        buf.put_u64(frame.mgmt_id());
        buf.put_u64(frame.agent_id());
        buf.put_u64(frame.seq());
        buf.put_u32(body.len() as u32);
        buf.put_u16(State::<ARC>::calculate(&body));
        buf.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use agent_manager_types::{Commands, names};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_request() -> Request {
        let cmds = Commands::new(vec![
            Command::new(names::STOP, json!({"vm": "i-2-10-VM"})).in_sequence(),
            Command::new(names::CHECK_VIRTUAL_MACHINE, json!({"vm": "i-2-10-VM"})),
        ])
        .stop_on_error(true);
        Request::new(12, 3, 0x7fff_0000_0000_0001, cmds)
    }

    fn encoded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        AgentCodec::default().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_request_header_fields_survive_codec() {
        let mut req = sample_request();
        req.forwarded = true;
        let mut buf = encoded(Frame::Request(req.clone()));
        assert_eq!(buf[OFF_VERSION], VERSION);

        let decoded = AgentCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Frame::Request(req));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_response_keeps_in_sequence_flag() {
        let req = sample_request();
        let answers = req.commands.iter().map(Answer::success).collect();
        let resp = Response::for_request(&req, answers);
        let mut buf = encoded(Frame::Response(resp.clone()));

        match AgentCodec::default().decode(&mut buf).unwrap() {
            Some(Frame::Response(decoded)) => {
                assert!(decoded.in_sequence);
                assert_eq!(decoded, resp);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_header_waits_for_more() {
        let full = encoded(Frame::Request(sample_request()));
        let mut buf = BytesMut::from(&full[..HEADER_LEN - 1]);
        assert!(AgentCodec::default().decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_LEN - 1);
    }

    #[test]
    fn test_partial_body_waits_for_more() {
        let full = encoded(Frame::Request(sample_request()));
        let mut codec = AgentCodec::default();
        let mut buf = BytesMut::from(&full[..full.len() - 5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 5..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_back_to_back_frames() {
        let first = sample_request();
        let mut second = sample_request();
        second.seq += 1;

        let mut buf = encoded(Frame::Request(first.clone()));
        buf.extend_from_slice(&encoded(Frame::Request(second.clone())));

        let mut codec = AgentCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Request(first)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Request(second)));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_body_fails_checksum() {
        let mut buf = encoded(Frame::Request(sample_request()));
        let last = buf.len() - 2;
        buf[last] ^= 0xff;
        assert!(matches!(
            AgentCodec::default().decode(&mut buf),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buf = encoded(Frame::Request(sample_request()));
        buf[OFF_VERSION] = VERSION + 1;
        assert!(matches!(
            AgentCodec::default().decode(&mut buf),
            Err(WireError::VersionMismatch { found: 2, expected: 1 })
        ));
    }

    #[test]
    fn test_oversized_body_rejected_before_buffering() {
        let mut buf = encoded(Frame::Request(sample_request()));
        let mut codec = AgentCodec::with_max_body(8);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::PayloadTooLarge { max: 8, .. })
        ));
    }

    #[test]
    fn test_control_frame_must_have_one_command() {
        let mut req = Request::control(1, 1, 1, Command::ping());
        req.commands.push(Command::ping());
        let mut buf = BytesMut::new();
        assert!(matches!(
            AgentCodec::default().encode(Frame::Request(req), &mut buf),
            Err(WireError::InvalidControl(2))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_control_answer_count_checked_on_decode() {
        // Hand-build a control response with an empty answer array.
        let body = b"[]";
        let mut buf = BytesMut::new();
        buf.put_u8(VERSION);
        buf.put_u16(FLAG_CONTROL);
        buf.put_u64(1);
        buf.put_u64(2);
        buf.put_u64(3);
        buf.put_u32(body.len() as u32);
        buf.put_u16(State::<ARC>::calculate(body));
        buf.extend_from_slice(body);

        assert!(matches!(
            AgentCodec::default().decode(&mut buf),
            Err(WireError::InvalidControl(0))
        ));
    }
}
