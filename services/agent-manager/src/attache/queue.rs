// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Sequencing and correlation state shared by every attache variant.
//!
//! Holds no locks of its own; the owning attache wraps it in one mutex.

use std::collections::BTreeMap;
use std::sync::Arc;

use agent_manager_types::MsId;
use agent_wire::Request;

use crate::listener::Listener;
use crate::timer::TimerHandle;

pub(crate) struct Registration {
    pub listener: Arc<dyn Listener>,
    pub recurring: bool,
    pub alarm: Option<TimerHandle>,
    /// Peer a forwarded request was routed to
    pub peer: Option<MsId>,
}

impl Registration {
    fn disarm(&self) {
        if let Some(alarm) = &self.alarm {
            alarm.cancel();
        }
    }
}

#[derive(Default)]
pub(crate) struct RequestQueue {
    /// Held in-sequence requests, sorted by sequence number
    pending: Vec<Request>,
    listeners: BTreeMap<u64, Registration>,
    /// The in-sequence request on the wire, if any
    current: Option<u64>,
}

impl RequestQueue {
    /// Insert a held request at its sorted position.
    ///
    /// # Panics
    ///
    /// If a request with the same sequence is already held. `Attache::send`
    /// refuses sequences in use, so a duplicate here is a bug in the caller.
    pub fn insert_pending(&mut self, req: Request) {
        match self.pending.binary_search_by_key(&req.seq, |r| r.seq) {
            Ok(_) => panic!("duplicate sequence {} in pending queue", req.seq),
            Err(pos) => self.pending.insert(pos, req),
        }
    }

    /// Whether `seq` is held or is the in-sequence request on the wire.
    pub fn in_use(&self, seq: u64) -> bool {
        self.current == Some(seq)
            || self
                .pending
                .binary_search_by_key(&seq, |r| r.seq)
                .is_ok()
    }

    pub fn remove_pending(&mut self, seq: u64) -> Option<Request> {
        self.pending
            .binary_search_by_key(&seq, |r| r.seq)
            .ok()
            .map(|pos| self.pending.remove(pos))
    }

    pub fn pop_lowest(&mut self) -> Option<Request> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    pub fn drain_pending(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn current(&self) -> Option<u64> {
        self.current
    }

    pub fn set_current(&mut self, seq: Option<u64>) {
        self.current = seq;
    }

    /// Register a listener for `seq`, replacing (and disarming) any
    /// earlier one.
    pub fn register(&mut self, seq: u64, reg: Registration) {
        if let Some(old) = self.listeners.insert(seq, reg) {
            old.disarm();
        }
    }

    pub fn unregister(&mut self, seq: u64) -> Option<Registration> {
        let reg = self.listeners.remove(&seq)?;
        reg.disarm();
        Some(reg)
    }

    /// Listener to hand an answer for `seq` to. Non-recurring registrations
    /// are consumed.
    pub fn take_for_answer(&mut self, seq: u64) -> Option<Arc<dyn Listener>> {
        let recurring = self.listeners.get(&seq)?.recurring;
        if recurring {
            self.listeners.get(&seq).map(|r| r.listener.clone())
        } else {
            self.unregister(seq).map(|r| r.listener)
        }
    }

    pub fn listener(&self, seq: u64) -> Option<Arc<dyn Listener>> {
        self.listeners.get(&seq).map(|r| r.listener.clone())
    }

    pub fn peer(&self, seq: u64) -> Option<MsId> {
        self.listeners.get(&seq).and_then(|r| r.peer)
    }

    pub fn tag_peer(&mut self, seq: u64, peer: MsId) {
        if let Some(reg) = self.listeners.get_mut(&seq) {
            reg.peer = Some(peer);
            reg.listener.set_peer(peer);
        }
    }

    pub fn non_recurring_count(&self) -> usize {
        self.listeners.values().filter(|r| !r.recurring).count()
    }

    pub fn drain_listeners(&mut self) -> Vec<Arc<dyn Listener>> {
        std::mem::take(&mut self.listeners)
            .into_values()
            .map(|r| {
                r.disarm();
                r.listener
            })
            .collect()
    }

    pub fn drain_non_recurring(&mut self) -> Vec<(u64, Arc<dyn Listener>)> {
        let seqs: Vec<u64> = self
            .listeners
            .iter()
            .filter(|(_, r)| !r.recurring)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.into_iter()
            .filter_map(|seq| self.unregister(seq).map(|r| (seq, r.listener)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use agent_manager_types::{Command, Commands};

    struct Nop(bool);
    impl Listener for Nop {
        fn is_recurring(&self) -> bool {
            self.0
        }
    }

    fn req(seq: u64) -> Request {
        Request::new(1, 1, seq, Commands::single(Command::ping().in_sequence()))
    }

    fn reg(recurring: bool) -> Registration {
        Registration {
            listener: Arc::new(Nop(recurring)),
            recurring,
            alarm: None,
            peer: None,
        }
    }

    #[test]
    fn test_pending_kept_sorted() {
        let mut q = RequestQueue::default();
        for seq in [9, 3, 7, 5] {
            q.insert_pending(req(seq));
        }
        assert_eq!(q.remove_pending(7).map(|r| r.seq), Some(7));
        assert!(q.remove_pending(7).is_none());
        let order: Vec<u64> = std::iter::from_fn(|| q.pop_lowest().map(|r| r.seq)).collect();
        assert_eq!(order, vec![3, 5, 9]);
    }

    #[test]
    #[should_panic(expected = "duplicate sequence 4")]
    fn test_duplicate_sequence_panics() {
        let mut q = RequestQueue::default();
        q.insert_pending(req(4));
        q.insert_pending(req(4));
    }

    #[test]
    fn test_held_and_current_sequences_are_in_use() {
        let mut q = RequestQueue::default();
        q.insert_pending(req(4));
        q.set_current(Some(6));
        assert!(q.in_use(4));
        assert!(q.in_use(6));
        assert!(!q.in_use(5));
    }

    #[test]
    fn test_recurring_registration_survives_answer() {
        let mut q = RequestQueue::default();
        q.register(1, reg(true));
        q.register(2, reg(false));
        assert_eq!(q.non_recurring_count(), 1);

        assert!(q.take_for_answer(1).is_some());
        assert!(q.take_for_answer(1).is_some());
        assert!(q.take_for_answer(2).is_some());
        assert!(q.take_for_answer(2).is_none());
        assert_eq!(q.non_recurring_count(), 0);
    }

    #[test]
    fn test_drain_non_recurring_keeps_recurring() {
        let mut q = RequestQueue::default();
        q.register(1, reg(true));
        q.register(2, reg(false));
        q.register(3, reg(false));
        q.tag_peer(3, 8);
        assert_eq!(q.peer(3), Some(8));

        let drained: Vec<u64> = q.drain_non_recurring().into_iter().map(|(s, _)| s).collect();
        assert_eq!(drained, vec![2, 3]);
        assert!(q.listener(1).is_some());
        assert_eq!(q.drain_listeners().len(), 1);
    }
}
