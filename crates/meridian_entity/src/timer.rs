//! The process-wide timer wheel.
//!
//! Entities register timers here; the hosting process drives the wheel from
//! its tick loop every [`SERVER_TICK_INTERVAL`], which is therefore the timer
//! resolution. Firing never runs user code directly; the tick loop posts a
//! `TimerFired` command into the owning entity's mailbox, and the entity's
//! serial context re-checks liveness before invoking the callback. That
//! re-check is what makes cancellation from inside the entity synchronous:
//! once the handle is gone from the entity's table, a fire already in the
//! mailbox is a no-op.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use meridian_proto::EntityId;

/// Nominal tick period of a server process; also the timer resolution.
pub const SERVER_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a scheduled timer, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub(crate) id: u64,
}

impl TimerHandle {
    /// The wheel-assigned timer id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
struct WheelEntry {
    owner: EntityId,
    period: Option<Duration>,
}

#[derive(Debug, Default)]
struct WheelState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, WheelEntry>,
    next_id: u64,
}

/// Shared timer wheel for one process.
#[derive(Debug, Default)]
pub struct TimerWheel {
    state: Mutex<WheelState>,
}

impl TimerWheel {
    /// Creates an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a timer for `owner`: one-shot after `delay`, or repeating
    /// every `period` after the first fire.
    pub fn schedule(&self, owner: EntityId, delay: Duration, period: Option<Duration>) -> TimerHandle {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(id, WheelEntry { owner, period });
        state.queue.push(Reverse((Instant::now() + delay, id)));
        TimerHandle { id }
    }

    /// Removes a timer. Safe to call for already-fired or unknown handles.
    pub fn cancel(&self, handle: TimerHandle) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.remove(&handle.id);
    }

    /// Removes every timer owned by `owner` (entity destroyed or migrating).
    pub fn cancel_all_for(&self, owner: EntityId) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.retain(|_, entry| entry.owner != owner);
    }

    /// Pops every timer due at `now`, re-arming repeating ones.
    ///
    /// Returns `(owner, timer id)` pairs in fire order; the caller posts a
    /// `TimerFired` command to each owner's mailbox.
    pub fn collect_due(&self, now: Instant) -> Vec<(EntityId, u64)> {
        let mut due = Vec::new();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(Reverse((fire_at, id))) = state.queue.peek().copied() {
            if fire_at > now {
                break;
            }
            state.queue.pop();
            let Some(entry) = state.entries.get(&id) else {
                // Cancelled while queued.
                continue;
            };
            due.push((entry.owner, id));
            if let Some(period) = entry.period {
                // Skip missed periods rather than bursting to catch up.
                let mut next = fire_at + period;
                if next <= now {
                    next = now + period;
                }
                state.queue.push(Reverse((next, id)));
            } else {
                state.entries.remove(&id);
            }
        }
        due
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    /// Whether no timers are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let wheel = TimerWheel::new();
        let owner = EntityId::new();
        wheel.schedule(owner, Duration::from_millis(30), None);

        assert!(wheel.collect_due(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_millis(30)).await;
        let due = wheel.collect_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, owner);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(wheel.collect_due(Instant::now()).is_empty());
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_rearms() {
        let wheel = TimerWheel::new();
        let owner = EntityId::new();
        wheel.schedule(owner, Duration::from_millis(10), Some(Duration::from_millis(10)));

        let mut fires = 0;
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(10)).await;
            fires += wheel.collect_due(Instant::now()).len();
        }
        assert_eq!(fires, 3);
        assert_eq!(wheel.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_collected() {
        let wheel = TimerWheel::new();
        let owner = EntityId::new();
        let handle = wheel.schedule(owner, Duration::from_millis(10), None);
        wheel.cancel(handle);

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(wheel.collect_due(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_for_owner() {
        let wheel = TimerWheel::new();
        let a = EntityId::new();
        let b = EntityId::new();
        wheel.schedule(a, Duration::from_millis(10), None);
        wheel.schedule(a, Duration::from_millis(10), Some(Duration::from_millis(10)));
        wheel.schedule(b, Duration::from_millis(10), None);
        wheel.cancel_all_for(a);

        tokio::time::advance(Duration::from_millis(10)).await;
        let due = wheel.collect_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, b);
    }

    #[tokio::test(start_paused = true)]
    async fn due_timers_fire_in_deadline_order() {
        let wheel = TimerWheel::new();
        let owner = EntityId::new();
        let late = wheel.schedule(owner, Duration::from_millis(20), None);
        let early = wheel.schedule(owner, Duration::from_millis(10), None);

        tokio::time::advance(Duration::from_millis(25)).await;
        let due = wheel.collect_due(Instant::now());
        assert_eq!(
            due.iter().map(|(_, id)| *id).collect::<Vec<_>>(),
            vec![early.id(), late.id()]
        );
    }
}
