// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

use thiserror::Error;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unsupported frame version {found}, expected {expected}")]
    VersionMismatch { found: u8, expected: u8 },

    #[error("frame checksum mismatch: header {expected:#06x}, body {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("frame body of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid frame payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("control frame must carry exactly one payload, found {0}")]
    InvalidControl(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
