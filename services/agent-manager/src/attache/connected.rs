// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Socket-backed link to an agent.

use std::net::SocketAddr;

use agent_wire::{Frame, WireError};
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound half of an agent socket. Frames are queued to a writer task so
/// callers never wait on the network.
#[derive(Debug)]
pub struct ConnectedLink {
    tx: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
    peer_addr: Option<SocketAddr>,
}

impl ConnectedLink {
    pub fn new(
        tx: mpsc::UnboundedSender<Frame>,
        shutdown: CancellationToken,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        ConnectedLink {
            tx,
            shutdown,
            peer_addr,
        }
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<(), Box<mpsc::error::SendError<Frame>>> {
        if self.shutdown.is_cancelled() {
            return Err(Box::new(mpsc::error::SendError(frame)));
        }
        self.tx.send(frame).map_err(Box::new)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    /// Stop the writer and the connection's reader.
    pub fn close(&self) {
        debug!(peer = ?self.peer_addr, "closing agent link");
        self.shutdown.cancel();
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Drain queued frames into `sink` until the channel closes, the link is
/// shut down, or a write fails. A failed write shuts the link down.
pub async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
) where
    S: Sink<Frame, Error = WireError> + Unpin,
{
    loop {
        // Queued frames go out before a shutdown is noticed.
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "agent write failed");
            shutdown.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}
