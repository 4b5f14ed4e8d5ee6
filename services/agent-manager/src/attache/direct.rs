// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! In-process link for hosts the manager drives directly.
//!
//! Commands run on a shared bounded pool. Each agent may keep at most
//! `cap` requests outstanding; ordinary work past the cap waits in a FIFO,
//! while periodic (cron) work past the cap is refused on the spot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use agent_manager_types::{Answer, Command, Commands, HostId};
use agent_wire::{Request, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{Attache, Link};
use crate::config::ManagerConfig;
use crate::error::Result;

/// Executes command content for a directly managed host.
#[async_trait]
pub trait ServerResource: Send + Sync {
    /// Prepare the resource and produce the startup command describing
    /// the host.
    async fn initialize(&self) -> Result<Command>;

    async fn execute_request(&self, cmd: &Command) -> Answer;

    /// A ping command reporting the host's state, or None if the state
    /// could not be read.
    async fn current_status(&self, host_id: HostId) -> Option<Command>;

    fn disconnected(&self) {}
}

/// Worker pools shared by all direct attaches of one manager.
#[derive(Clone, Debug)]
pub struct DirectAgentPools {
    work: Arc<Semaphore>,
    cron: Arc<Semaphore>,
    cap: usize,
    ping_interval: Duration,
}

impl DirectAgentPools {
    pub fn new(pool_size: usize, cap: usize, ping_interval: Duration) -> Self {
        DirectAgentPools {
            work: Arc::new(Semaphore::new(pool_size.max(1))),
            cron: Arc::new(Semaphore::new(pool_size.max(1))),
            cap: cap.max(1),
            ping_interval,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(
            config.direct_agent_pool_size,
            config.direct_agent_cap(),
            config.ping_interval(),
        )
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

pub(crate) struct DirectLink {
    resource: Arc<dyn ServerResource>,
    pools: DirectAgentPools,
    outstanding: AtomicUsize,
    outstanding_cron: AtomicUsize,
    backlog: Mutex<VecDeque<Request>>,
    tasks: Mutex<Vec<AbortHandle>>,
    stopped: AtomicBool,
}

const STOPPED_BY_FAILURE: &str = "Stopped by previous failure";
const OUTSTANDING_LIMIT: &str = "Maximum outstanding limit reached";

/// Run every command of `req`, honoring stop-on-error so answers stay 1:1
/// with commands.
async fn execute(resource: &dyn ServerResource, req: &Request) -> Vec<Answer> {
    let mut answers = Vec::with_capacity(req.commands.len());
    let mut failed = false;
    for cmd in &req.commands {
        if failed {
            answers.push(Answer::failure(cmd, STOPPED_BY_FAILURE));
            continue;
        }
        let answer = resource.execute_request(cmd).await;
        failed = req.stop_on_error && !answer.result;
        answers.push(answer);
    }
    answers
}

fn direct_link(attache: &Attache) -> Option<&DirectLink> {
    match &attache.link {
        Link::Direct(link) => Some(link),
        _ => None,
    }
}

impl DirectLink {
    pub fn new(resource: Arc<dyn ServerResource>, pools: DirectAgentPools) -> Self {
        DirectLink {
            resource,
            pools,
            outstanding: AtomicUsize::new(0),
            outstanding_cron: AtomicUsize::new(0),
            backlog: Mutex::new(VecDeque::new()),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    pub fn submit(&self, attache: &Arc<Attache>, req: Request) {
        if req.is_cron() {
            if self.outstanding_cron.load(Ordering::Acquire) >= self.pools.cap {
                warn!(host_id = attache.id(), seq = req.seq, "refusing cron task over cap");
                let answers = req
                    .commands
                    .iter()
                    .map(|c| Answer::failure(c, OUTSTANDING_LIMIT))
                    .collect();
                attache.deliver(&Response::for_request(&req, answers));
                return;
            }
            self.schedule_cron(attache, req);
            return;
        }

        {
            let mut backlog = self.backlog.lock();
            if self.outstanding.load(Ordering::Acquire) >= self.pools.cap {
                debug!(host_id = attache.id(), seq = req.seq, "direct agent busy, queueing");
                backlog.push_back(req);
                return;
            }
            self.outstanding.fetch_add(1, Ordering::AcqRel);
        }
        self.spawn_work(attache, req);
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    fn spawn_work(&self, attache: &Arc<Attache>, req: Request) {
        let weak = Arc::downgrade(attache);
        let resource = self.resource.clone();
        let work = self.pools.work.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = work.acquire_owned().await else {
                return;
            };
            let answers = execute(resource.as_ref(), &req).await;
            let Some(attache) = weak.upgrade() else {
                return;
            };
            attache.deliver(&Response::for_request(&req, answers));
            if let Some(link) = direct_link(&attache) {
                link.work_done(&attache);
            }
        });
        self.track(handle.abort_handle());
    }

    /// Release one slot, or hand it to the oldest queued request.
    fn work_done(&self, attache: &Arc<Attache>) {
        let next = {
            let mut backlog = self.backlog.lock();
            let next = backlog.pop_front();
            if next.is_none() {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
            }
            next
        };
        if let Some(req) = next {
            if self.is_stopped() {
                return;
            }
            self.spawn_work(attache, req);
        }
    }

    fn schedule_cron(&self, attache: &Arc<Attache>, req: Request) {
        self.outstanding_cron.fetch_add(1, Ordering::AcqRel);
        let interval = req
            .first_command()
            .and_then(|c| c.interval_secs)
            .unwrap_or(1)
            .max(1);
        debug!(host_id = attache.id(), seq = req.seq, interval, "scheduling cron task");

        let weak = Arc::downgrade(attache);
        let resource = self.resource.clone();
        let cron = self.pools.cron.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let answers = {
                    let Ok(_permit) = cron.acquire().await else {
                        break;
                    };
                    execute(resource.as_ref(), &req).await
                };
                let Some(attache) = weak.upgrade() else {
                    break;
                };
                attache.deliver(&Response::for_request(&req, answers));
            }
        });
        self.track(handle.abort_handle());
    }

    /// Periodically read the host's status and feed it to the manager as
    /// if the agent had pinged.
    pub fn start_ping(&self, attache: &Arc<Attache>) {
        let weak = Arc::downgrade(attache);
        let period = self.pools.ping_interval.max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(attache) = weak.upgrade() else {
                    break;
                };
                let Some(link) = direct_link(&attache) else {
                    break;
                };
                if link.outstanding_cron.load(Ordering::Acquire) >= link.pools.cap {
                    warn!(host_id = attache.id(), "skipping status ping, cron tasks over cap");
                    continue;
                }
                let Some(status) = link.resource.current_status(attache.id()).await else {
                    warn!(host_id = attache.id(), "unable to read current status");
                    continue;
                };
                let Some(events) = attache.ctx.events.upgrade() else {
                    break;
                };
                let req = Request::new(
                    attache.id(),
                    attache.ms_id(),
                    attache.next_sequence(),
                    Commands::single(status),
                );
                events.commands_received(attache.clone(), req).await;
            }
        });
        self.track(handle.abort_handle());
    }

    /// Abort every task and release the resource. Only the first call has
    /// an effect.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.backlog.lock().clear();
        self.resource.disconnected();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::attache::tests::context;
    use crate::attache::{AttacheContext, AttacheEvents};
    use crate::sync_listener::SynchronousListener;
    use agent_manager_types::{HostStatus, names};
    use serde_json::Value;
    use std::sync::Weak;

    /// Answers every command after `delay`, failing commands named "Fail".
    struct Scripted {
        delay: Duration,
        executed: Mutex<Vec<String>>,
        disconnects: AtomicUsize,
    }

    impl Scripted {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Scripted {
                delay,
                executed: Mutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ServerResource for Scripted {
        async fn initialize(&self) -> Result<Command> {
            Ok(Command::new(names::STARTUP, Value::Null))
        }

        async fn execute_request(&self, cmd: &Command) -> Answer {
            tokio::time::sleep(self.delay).await;
            self.executed.lock().push(cmd.name.clone());
            if cmd.name == "Fail" {
                Answer::failure(cmd, "boom")
            } else {
                Answer::success(cmd)
            }
        }

        async fn current_status(&self, _host_id: HostId) -> Option<Command> {
            Some(Command::ping())
        }

        fn disconnected(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn attache(resource: Arc<Scripted>, cap: usize) -> Arc<Attache> {
        let a = Attache::direct(
            5,
            "direct-5",
            context(),
            resource,
            DirectAgentPools::new(8, cap, Duration::from_secs(60)),
        );
        a.ready();
        a
    }

    fn batch(a: &Attache, names: &[&str], stop_on_error: bool) -> Request {
        let cmds = names
            .iter()
            .map(|n| Command::new(*n, Value::Null))
            .collect::<Vec<_>>();
        Request::new(
            a.id(),
            1,
            a.next_sequence(),
            Commands::new(cmds).stop_on_error(stop_on_error),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_error_fills_remaining_answers() {
        let resource = Scripted::new(Duration::from_millis(10));
        let a = attache(resource.clone(), 4);

        let answers = a
            .send_sync(
                batch(&a, &["One", "Fail", "Three"], true),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(answers.len(), 3);
        assert!(answers[0].result);
        assert!(!answers[1].result);
        assert_eq!(answers[2].details.as_deref(), Some(STOPPED_BY_FAILURE));
        assert_eq!(*resource.executed.lock(), vec!["One", "Fail"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_over_cap_waits_in_backlog() {
        let resource = Scripted::new(Duration::from_secs(10));
        let a = attache(resource.clone(), 1);

        let first = Arc::new(SynchronousListener::new());
        let second = Arc::new(SynchronousListener::new());
        a.send(batch(&a, &["A"], false), Some(first.clone()))
            .await
            .unwrap();
        a.send(batch(&a, &["B"], false), Some(second.clone()))
            .await
            .unwrap();
        assert_eq!(direct_link(&a).unwrap().backlog_len(), 1);

        assert!(first.wait_for(Duration::from_secs(11)).await.is_some());
        assert!(second.answers().is_none());
        assert!(second.wait_for(Duration::from_secs(11)).await.is_some());
        assert_eq!(*resource.executed.lock(), vec!["A", "B"]);
        assert_eq!(direct_link(&a).unwrap().backlog_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_over_cap_is_refused() {
        let resource = Scripted::new(Duration::from_millis(1));
        let a = attache(resource.clone(), 1);

        let cron = |a: &Attache| {
            Request::new(
                a.id(),
                1,
                a.next_sequence(),
                Commands::single(Command::new("Poll", Value::Null).every(30)),
            )
        };
        a.send(cron(&a), None).await.unwrap();

        let refused = Arc::new(SynchronousListener::new());
        a.send(cron(&a), Some(refused.clone())).await.unwrap();
        let answers = refused.answers().unwrap();
        assert_eq!(answers[0].details.as_deref(), Some(OUTSTANDING_LIMIT));

        // The accepted task runs immediately and then every interval.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(resource.executed.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_resource_once() {
        let resource = Scripted::new(Duration::from_secs(30));
        let a = attache(resource.clone(), 2);
        let waiting = Arc::new(SynchronousListener::new());
        a.send(batch(&a, &["Slow"], false), Some(waiting.clone()))
            .await
            .unwrap();

        a.disconnect(HostStatus::Disconnected);
        a.disconnect(HostStatus::Disconnected);
        assert!(waiting.is_disconnected());
        assert!(a.is_closed());
        assert_eq!(resource.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_ping_reaches_manager() {
        struct Pings(AtomicUsize);

        #[async_trait]
        impl AttacheEvents for Pings {
            fn answers_received(&self, _: HostId, _: &Response) {}
            async fn commands_received(&self, _: Arc<Attache>, req: Request) -> Vec<Answer> {
                assert_eq!(req.commands[0].name, names::PING);
                self.0.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            }
        }

        let pings = Arc::new(Pings(AtomicUsize::new(0)));
        let weak: Weak<Pings> = Arc::downgrade(&pings);
        let events: Weak<dyn AttacheEvents> = weak;
        let ctx = AttacheContext {
            events,
            ..context()
        };
        let _a = Attache::direct(
            6,
            "direct-6",
            ctx,
            Scripted::new(Duration::ZERO),
            DirectAgentPools::new(2, 2, Duration::from_secs(60)),
        );

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(pings.0.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(pings.0.load(Ordering::SeqCst), 2);
    }
}
