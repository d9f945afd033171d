//! Tick Scheduler
//!
//! Cancellable timed continuations. Every wait in the game (effect expiry,
//! trap rearm, candy respawn, phase delays) is an entry here, fired by the
//! game loop when its due tick is reached. Nothing ever sleeps.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

use crate::game::state::NetworkId;

/// Handle to a scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerHandle(pub u64);

/// Work performed when a timer fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerTask {
    /// Reset a player's speed multiplier to 1.0.
    ClearSpeed(NetworkId),
    /// Lift a player's movement lock.
    ClearLock(NetworkId),
    /// Return a trap to Armed.
    RearmTrap(NetworkId),
    /// Spawn a new candy at a spawner.
    RespawnCandy(NetworkId),
}

impl TimerTask {
    /// Entity the task acts on.
    pub fn target(&self) -> NetworkId {
        match *self {
            TimerTask::ClearSpeed(id)
            | TimerTask::ClearLock(id)
            | TimerTask::RearmTrap(id)
            | TimerTask::RespawnCandy(id) => id,
        }
    }
}

/// Timer queue ordered by (due tick, handle).
#[derive(Clone, Debug, Default)]
pub struct Scheduler {
    queue: BTreeMap<(u64, TimerHandle), TimerTask>,
    due: BTreeMap<TimerHandle, u64>,
    next_handle: u64,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a task at an absolute tick.
    pub fn schedule_at(&mut self, tick: u64, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.queue.insert((tick, handle), task);
        self.due.insert(handle, tick);
        handle
    }

    /// Schedule a task `delay` ticks after `now`.
    pub fn schedule_after(&mut self, now: u64, delay: u64, task: TimerTask) -> TimerHandle {
        self.schedule_at(now.saturating_add(delay), task)
    }

    /// Cancel a pending task. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.due.remove(&handle) {
            Some(tick) => self.queue.remove(&(tick, handle)).is_some(),
            None => false,
        }
    }

    /// Cancel every task acting on an entity.
    pub fn cancel_for(&mut self, id: NetworkId) -> usize {
        let handles: Vec<(u64, TimerHandle)> = self.queue.iter()
            .filter(|(_, task)| task.target() == id)
            .map(|(key, _)| *key)
            .collect();

        for (tick, handle) in &handles {
            self.queue.remove(&(*tick, *handle));
            self.due.remove(handle);
        }
        handles.len()
    }

    /// True if the task has not fired or been cancelled.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.due.contains_key(&handle)
    }

    /// Due tick of a pending task.
    pub fn due_tick(&self, handle: TimerHandle) -> Option<u64> {
        self.due.get(&handle).copied()
    }

    /// Remove and return every task due at or before `now`, in due order.
    pub fn pop_due(&mut self, now: u64) -> Vec<(TimerHandle, TimerTask)> {
        let mut fired = Vec::new();
        while let Some((&(tick, handle), _)) = self.queue.first_key_value() {
            if tick > now {
                break;
            }
            if let Some(task) = self.queue.remove(&(tick, handle)) {
                self.due.remove(&handle);
                fired.push((handle, task));
            }
        }
        fired
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every pending task.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.due.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_due_order() {
        let mut s = Scheduler::new();
        s.schedule_at(20, TimerTask::RearmTrap(NetworkId(1)));
        s.schedule_at(10, TimerTask::ClearSpeed(NetworkId(2)));
        s.schedule_at(10, TimerTask::ClearLock(NetworkId(3)));

        assert!(s.pop_due(9).is_empty());

        let fired: Vec<TimerTask> = s.pop_due(15).into_iter().map(|(_, t)| t).collect();
        assert_eq!(fired, vec![TimerTask::ClearSpeed(NetworkId(2)), TimerTask::ClearLock(NetworkId(3))]);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let mut s = Scheduler::new();
        let h = s.schedule_after(0, 5, TimerTask::ClearSpeed(NetworkId(1)));
        assert!(s.is_pending(h));
        assert_eq!(s.due_tick(h), Some(5));

        assert!(s.cancel(h));
        assert!(!s.cancel(h));
        assert!(s.pop_due(100).is_empty());
    }

    #[test]
    fn test_fired_handle_no_longer_pending() {
        let mut s = Scheduler::new();
        let h = s.schedule_at(1, TimerTask::RespawnCandy(NetworkId(4)));
        s.pop_due(1);
        assert!(!s.is_pending(h));
        assert!(!s.cancel(h));
    }

    #[test]
    fn test_cancel_for_entity() {
        let mut s = Scheduler::new();
        s.schedule_at(3, TimerTask::ClearSpeed(NetworkId(1)));
        s.schedule_at(4, TimerTask::ClearLock(NetworkId(1)));
        let other = s.schedule_at(5, TimerTask::ClearLock(NetworkId(2)));

        assert_eq!(s.cancel_for(NetworkId(1)), 2);
        assert_eq!(s.len(), 1);
        assert!(s.is_pending(other));
    }
}
