//! Connection-pool admission control.
//!
//! Each tunnel connection id is in one of three states: `Running` (carrying
//! tasks), `Idle` (warm, ready to accept tasks), or `Wait` (parked; its
//! connect loop is blocked and holds no physical connection). The manager
//! keeps `running + idle` at the configured floor while letting surplus
//! connections retire under low load, and serializes which parked loop gets
//! to become the next spare so reconnects never stampede.
//!
//! This is cooperative sizing, not a hard limit: `remote_connections` bounds
//! the maximum and `remote_idle_connections` the minimum kept warm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Idle,
    Wait,
}

pub struct IdleManager {
    status: Mutex<HashMap<u64, Status>>,
    notify: Notify,
    closed: AtomicBool,
    min: usize,
}

impl IdleManager {
    pub fn new(min: u32) -> Self {
        Self {
            status: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            min: min as usize,
        }
    }

    /// First transition for a connect loop. Marks the id idle; if the pool
    /// already holds more than `min` running-or-idle connections the id is
    /// parked instead and the caller must not open a physical connection.
    pub fn init_idle(&self, id: u64) -> bool {
        let mut status = self.status.lock().unwrap();
        if status.get(&id) == Some(&Status::Idle) {
            return false;
        }
        status.insert(id, Status::Idle);
        let active = status
            .values()
            .filter(|s| matches!(s, Status::Running | Status::Idle))
            .count();
        if active <= self.min {
            return false;
        }
        status.insert(id, Status::Wait);
        true
    }

    /// Mark running because a task landed. When the connection was already
    /// running and is carrying enough tasks, wake one parked loop - load is
    /// the signal that the pool needs another spare.
    pub fn set_running_with_task_count(&self, id: u64, task_count: u32) {
        let mut status = self.status.lock().unwrap();
        if status.get(&id) == Some(&Status::Running) {
            if task_count >= 3 {
                self.notify.notify_one();
            }
            return;
        }
        status.insert(id, Status::Running);
    }

    pub fn set_running(&self, id: u64) {
        let mut status = self.status.lock().unwrap();
        if status.get(&id) == Some(&Status::Running) {
            return;
        }
        status.insert(id, Status::Running);
        self.notify.notify_one();
    }

    pub fn set_idle(&self, id: u64) {
        self.status.lock().unwrap().insert(id, Status::Idle);
    }

    pub fn set_wait(&self, id: u64) {
        self.status.lock().unwrap().insert(id, Status::Wait);
    }

    /// Volunteer `id` for retirement. Succeeds only while the idle count
    /// stays above the floor afterwards.
    pub fn change_to_wait(&self, id: u64) -> bool {
        let mut status = self.status.lock().unwrap();
        let idle = status.values().filter(|s| **s == Status::Idle).count();
        if idle <= self.min {
            return false;
        }
        status.insert(id, Status::Wait);
        true
    }

    /// Park until no other connection holds the idle slot, then claim it
    /// for `id`. At most one parked loop proceeds at a time.
    pub async fn wait_idle(&self, id: u64) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                if self.closed.load(Ordering::Acquire) {
                    return;
                }
                let mut status = self.status.lock().unwrap();
                if !status.values().any(|s| *s == Status::Idle) {
                    status.insert(id, Status::Idle);
                    return;
                }
            }
            notified.await;
        }
    }

    /// Release every parked loop; used at shutdown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn idle_count(&self) -> usize {
        self.count(Status::Idle)
    }

    pub fn running_count(&self) -> usize {
        self.count(Status::Running)
    }

    pub fn wait_count(&self) -> usize {
        self.count(Status::Wait)
    }

    fn count(&self, wanted: Status) -> usize {
        self.status
            .lock()
            .unwrap()
            .values()
            .filter(|s| **s == wanted)
            .count()
    }

    /// Snapshot for diagnostics.
    pub fn statuses(&self) -> HashMap<u64, Status> {
        self.status.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn init_idle_fills_the_floor_then_parks() {
        let m = IdleManager::new(2);
        assert!(!m.init_idle(1));
        assert!(!m.init_idle(2));
        // Floor reached: the third connection is told to park.
        assert!(m.init_idle(3));
        assert_eq!(m.idle_count(), 2);
        assert_eq!(m.wait_count(), 1);
    }

    #[test]
    fn init_idle_is_idempotent_while_idle() {
        let m = IdleManager::new(1);
        assert!(!m.init_idle(1));
        assert!(!m.init_idle(1));
        assert_eq!(m.idle_count(), 1);
    }

    #[test]
    fn running_connections_count_toward_the_floor() {
        let m = IdleManager::new(2);
        assert!(!m.init_idle(1));
        m.set_running(1);
        assert!(!m.init_idle(2));
        // running(1) + idle(2) == min: id 3 still parks.
        assert!(m.init_idle(3));
        assert!(m.running_count() + m.idle_count() >= 2);
    }

    #[test]
    fn change_to_wait_never_shrinks_below_the_floor() {
        let m = IdleManager::new(1);
        assert!(!m.init_idle(1));
        // Only one idle connection: may not retire.
        assert!(!m.change_to_wait(1));

        m.set_idle(2);
        assert_eq!(m.idle_count(), 2);
        assert!(m.change_to_wait(1));
        assert_eq!(m.idle_count(), 1);
        assert!(!m.change_to_wait(2));
    }

    #[test]
    fn floor_invariant_holds_across_transitions() {
        let m = IdleManager::new(2);
        for id in 1..=4 {
            m.init_idle(id);
        }
        m.set_running_with_task_count(1, 1);
        m.set_running_with_task_count(2, 5);
        m.set_idle(1);
        m.change_to_wait(2);
        assert!(m.running_count() + m.idle_count() >= 2);
    }

    #[tokio::test]
    async fn wait_idle_claims_only_when_no_other_idle() {
        let m = Arc::new(IdleManager::new(1));
        m.init_idle(1);
        assert_eq!(m.idle_count(), 1);

        let m2 = Arc::clone(&m);
        let waiter = tokio::spawn(async move {
            m2.wait_idle(2).await;
        });
        // The spare slot is taken by id 1, so the waiter stays parked.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Id 1 starts running: the slot frees up and id 2 claims it.
        m.set_running(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
        assert_eq!(m.statuses().get(&2), Some(&Status::Idle));
    }

    #[tokio::test]
    async fn wait_idle_serializes_claimants() {
        let m = Arc::new(IdleManager::new(1));
        m.init_idle(1);

        let mut waiters = Vec::new();
        for id in 2..=4 {
            let m = Arc::clone(&m);
            waiters.push(tokio::spawn(async move { m.wait_idle(id).await }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        // Each wake lets exactly one claimant through; claiming re-occupies
        // the idle slot so the others stay parked.
        m.set_running(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let finished = waiters.iter().filter(|w| w.is_finished()).count();
        assert_eq!(finished, 1);
        assert_eq!(m.idle_count(), 1);

        m.close();
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("close releases all waiters")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let m = Arc::new(IdleManager::new(1));
        m.init_idle(1);
        let m2 = Arc::clone(&m);
        let waiter = tokio::spawn(async move { m2.wait_idle(9).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        m.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released on close")
            .unwrap();
    }
}
