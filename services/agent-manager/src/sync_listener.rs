// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! A listener that lets one caller wait for the answer to its request.

use std::time::Duration;

use agent_manager_types::{Answer, HostId, HostStatus, MsId};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::listener::{Dispatch, Listener};

#[derive(Debug, Clone)]
enum Outcome {
    Waiting,
    Answered(Vec<Answer>),
    Disconnected,
}

/// Stores the first answer set or disconnect it sees and wakes the waiter.
#[derive(Debug)]
pub struct SynchronousListener {
    outcome: Mutex<Outcome>,
    notify: Notify,
    peer: Mutex<Option<MsId>>,
}

impl Default for SynchronousListener {
    fn default() -> Self {
        SynchronousListener {
            outcome: Mutex::new(Outcome::Waiting),
            notify: Notify::new(),
            peer: Mutex::new(None),
        }
    }
}

impl SynchronousListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `wait` for answers. Returns None on timeout or if the
    /// agent disconnected first.
    pub async fn wait_for(&self, wait: Duration) -> Option<Vec<Answer>> {
        if let Some(done) = self.settled() {
            return done;
        }
        // A notification sent before we got here is kept as a permit.
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.answers()
    }

    fn settled(&self) -> Option<Option<Vec<Answer>>> {
        match &*self.outcome.lock() {
            Outcome::Waiting => None,
            Outcome::Answered(a) => Some(Some(a.clone())),
            Outcome::Disconnected => Some(None),
        }
    }

    pub fn answers(&self) -> Option<Vec<Answer>> {
        match &*self.outcome.lock() {
            Outcome::Answered(a) => Some(a.clone()),
            _ => None,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(*self.outcome.lock(), Outcome::Disconnected)
    }

    /// Peer the request was forwarded to, if any.
    pub fn peer(&self) -> Option<MsId> {
        *self.peer.lock()
    }

    fn settle(&self, outcome: Outcome) {
        let mut current = self.outcome.lock();
        if matches!(*current, Outcome::Waiting) {
            *current = outcome;
            drop(current);
            self.notify.notify_one();
        }
    }
}

impl Listener for SynchronousListener {
    fn process_answers(&self, _host_id: HostId, _seq: u64, answers: &[Answer]) -> Dispatch {
        self.settle(Outcome::Answered(answers.to_vec()));
        Dispatch::Handled
    }

    fn process_disconnect(&self, host_id: HostId, status: HostStatus) -> Dispatch {
        tracing::debug!(host_id, %status, "waiter released by disconnect");
        self.settle(Outcome::Disconnected);
        Dispatch::Handled
    }

    fn set_peer(&self, peer: MsId) {
        *self.peer.lock() = Some(peer);
    }
}
