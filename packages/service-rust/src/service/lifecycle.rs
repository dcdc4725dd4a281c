//! Dispatcher lifecycle with in-flight dispatch tracking.
//!
//! State lives in an `ArcSwap`. Dispatches are counted by RAII guards, so a
//! dispatch stays counted until its terminal event is out even if the
//! operation panics; the guard that brings the count to zero wakes drain
//! waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

/// State machine: Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Accepting dispatches.
    Running,
    /// Shutdown requested; new dispatches are rejected, in-flight ones finish.
    Draining,
    /// All in-flight dispatches have delivered their terminal event.
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

#[derive(Debug)]
pub struct Lifecycle {
    in_flight: Arc<InFlight>,
    state: ArcSwap<DispatcherState>,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(InFlight::default()),
            state: ArcSwap::from_pointee(DispatcherState::Running),
        }
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    /// Moves to `Draining`. Returns `false` if shutdown had already begun.
    pub fn begin_drain(&self) -> bool {
        let previous = self.state.rcu(|current| match **current {
            DispatcherState::Running => Arc::new(DispatcherState::Draining),
            _ => Arc::clone(current),
        });
        *previous == DispatcherState::Running
    }

    /// Creates a guard that counts one dispatch as in flight until dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits for every in-flight dispatch to finish, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` once the count reaches zero.
    /// Returns `false` if the timeout expired first; the state stays
    /// `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let woken = self.in_flight.idle.notified();
                tokio::pin!(woken);
                // Register before reading the count so a release in between
                // is not missed.
                woken.as_mut().enable();
                if self.in_flight_count() == 0 {
                    return;
                }
                woken.await;
            }
        };
        let drained = tokio::time::timeout(timeout, idle).await.is_ok();
        if drained {
            self.state.store(Arc::new(DispatcherState::Stopped));
        }
        drained
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), DispatcherState::Running);
        assert!(lifecycle.is_accepting());
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn begin_drain_only_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_drain());
        assert!(!lifecycle.begin_drain());
        assert_eq!(lifecycle.state(), DispatcherState::Draining);
        assert!(!lifecycle.is_accepting());
    }

    #[test]
    fn guards_track_in_flight() {
        let lifecycle = Lifecycle::new();
        let a = lifecycle.in_flight_guard();
        let b = lifecycle.in_flight_guard();
        assert_eq!(lifecycle.in_flight_count(), 2);
        drop(a);
        assert_eq!(lifecycle.in_flight_count(), 1);
        drop(b);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn guard_drops_during_panic() {
        let lifecycle = Lifecycle::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lifecycle.in_flight_guard();
            panic!("operation blew up");
        }));
        assert!(result.is_err());
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_completes_when_idle() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_drain();
        assert!(lifecycle.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(lifecycle.state(), DispatcherState::Stopped);
    }

    #[tokio::test]
    async fn drain_times_out_with_in_flight_work() {
        let lifecycle = Lifecycle::new();
        let _guard = lifecycle.in_flight_guard();
        lifecycle.begin_drain();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(lifecycle.state(), DispatcherState::Draining);
    }

    #[tokio::test]
    async fn drain_waits_for_guard_release() {
        let lifecycle = Arc::new(Lifecycle::new());
        let guard = lifecycle.in_flight_guard();
        lifecycle.begin_drain();
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_for_drain(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn drain_waits_for_the_last_of_several_guards() {
        let lifecycle = Arc::new(Lifecycle::new());
        let first = lifecycle.in_flight_guard();
        let second = lifecycle.in_flight_guard();
        lifecycle.begin_drain();
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_for_drain(Duration::from_secs(2)).await })
        };
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(lifecycle.state(), DispatcherState::Draining);
        drop(second);
        assert!(waiter.await.unwrap());
        assert_eq!(lifecycle.state(), DispatcherState::Stopped);
    }
}
