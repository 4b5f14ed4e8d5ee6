// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared alarm service for listener timeouts.
//!
//! One service is created per manager and handed to every attache, so
//! stopping the manager cancels every alarm still armed.

use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct TimerService {
    shutdown: CancellationToken,
}

/// An armed alarm. Dropping the handle does not cancel it.
#[derive(Debug)]
pub struct TimerHandle(AbortHandle);

impl TimerHandle {
    pub fn cancel(&self) {
        self.0.abort();
    }
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `after` unless cancelled first.
    pub fn schedule<F, Fut>(&self, after: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => task().await,
                _ = shutdown.cancelled() => {}
            }
        });
        TimerHandle(handle.abort_handle())
    }

    /// Cancel every alarm scheduled through this service.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_alarm_fires_after_delay() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _h = timers.schedule(Duration::from_secs(10), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_alarm_never_fires() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let h = timers.schedule(Duration::from_secs(10), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        h.cancel();

        let f = fired.clone();
        let _other = timers.schedule(Duration::from_secs(10), move || async move {
            f.fetch_add(10, Ordering::SeqCst);
        });
        timers.shutdown();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.is_shutdown());
    }
}
