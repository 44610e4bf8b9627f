//! Delayed callbacks for the retry cooldown and the settle delay.
//!
//! Timers do not own closures. A scheduler only remembers *what kind* of
//! timer it is holding and hands a [`TimerFired`] back to whoever drives the
//! runtime, which routes it to the owning component. Components compare the
//! handle (and, for settles, the session sequence) against their own state,
//! so a timer that fires after being superseded is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opaque identifier for a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// Which component a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Cooldown before the retry controller asks for a regeneration.
    RetryCooldown,
    /// Settle delay of the generation session with this sequence number.
    Settle { sequence: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub handle: TimerHandle,
    pub kind: TimerKind,
}

pub trait Scheduler {
    /// Arms a one-shot timer that fires after `delay`.
    fn schedule_after(&mut self, delay: Duration, kind: TimerKind) -> TimerHandle;

    /// Cancels a timer. Unknown or already fired handles are ignored.
    fn cancel(&mut self, handle: TimerHandle);

    /// Cancels every outstanding timer.
    fn cancel_all(&mut self);
}

#[derive(Debug, Clone)]
struct PendingTimer {
    handle: TimerHandle,
    due: Duration,
    kind: TimerKind,
}

/// Deterministic scheduler driven by a virtual clock.
///
/// Time only moves when the owner calls [`ManualScheduler::pop_due`] or
/// [`ManualScheduler::set_now`]; timers fire in due order, ties broken by
/// scheduling order.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    now: Duration,
    next_handle: u64,
    pending: Vec<PendingTimer>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elapsed virtual time since creation.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.pending.iter().any(|timer| timer.handle == handle)
    }

    /// Due time of the earliest pending timer.
    pub fn next_due(&self) -> Option<Duration> {
        self.pending.iter().map(|timer| timer.due).min()
    }

    /// Removes the earliest timer due at or before `deadline` and moves the
    /// clock to its due time.
    pub fn pop_due(&mut self, deadline: Duration) -> Option<TimerFired> {
        let position = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, timer)| timer.due <= deadline)
            .min_by_key(|(_, timer)| (timer.due, timer.handle))
            .map(|(position, _)| position)?;
        let timer = self.pending.remove(position);
        if timer.due > self.now {
            self.now = timer.due;
        }
        Some(TimerFired {
            handle: timer.handle,
            kind: timer.kind,
        })
    }

    /// Moves the clock forward without firing anything. Never goes backwards.
    pub fn set_now(&mut self, now: Duration) {
        if now > self.now {
            self.now = now;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&mut self, delay: Duration, kind: TimerKind) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.pending.push(PendingTimer {
            handle,
            due: self.now.saturating_add(delay),
            kind,
        });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.pending.retain(|timer| timer.handle != handle);
    }

    fn cancel_all(&mut self) {
        self.pending.clear();
    }
}

/// Scheduler backed by tokio timers.
///
/// Each timer is a spawned task racing a sleep against its cancellation
/// token; when the sleep wins, a [`TimerFired`] is pushed onto the channel
/// the service loop reads from. The deadline is fixed when the timer is
/// scheduled, not when the task first runs. Must be used inside a tokio
/// runtime.
#[derive(Debug)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<TimerFired>,
    timers: HashMap<TimerHandle, CancellationToken>,
    next_handle: u64,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            timers: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Forgets a timer whose fire message has been received. Returns false
    /// when the timer was cancelled after its message was already queued.
    pub fn complete(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(&handle).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&mut self, delay: Duration, kind: TimerKind) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        let deadline = tokio::time::Instant::now() + delay;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = tx.send(TimerFired { handle, kind });
                }
            }
        });
        self.timers.insert(handle, token);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(token) = self.timers.remove(&handle) {
            token.cancel();
        }
    }

    fn cancel_all(&mut self) {
        for (_, token) in self.timers.drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_manual_fires_in_due_order() {
        let mut scheduler = ManualScheduler::new();
        let late = scheduler.schedule_after(Duration::from_millis(500), TimerKind::RetryCooldown);
        let settle = TimerKind::Settle { sequence: 1 };
        let early = scheduler.schedule_after(Duration::from_millis(100), settle);

        let deadline = Duration::from_millis(1000);
        let first = scheduler.pop_due(deadline);
        assert_eq!(first.map(|fired| fired.handle), Some(early));
        assert_eq!(scheduler.now(), Duration::from_millis(100));

        let second = scheduler.pop_due(deadline);
        assert_eq!(second.map(|fired| fired.handle), Some(late));
        assert_eq!(scheduler.now(), Duration::from_millis(500));
        assert!(scheduler.pop_due(deadline).is_none());
    }

    #[test]
    fn test_manual_respects_deadline() {
        let mut scheduler = ManualScheduler::new();
        scheduler.schedule_after(Duration::from_millis(1000), TimerKind::RetryCooldown);
        assert!(scheduler.pop_due(Duration::from_millis(999)).is_none());
        assert_eq!(scheduler.pending_count(), 1);
        assert!(scheduler.pop_due(Duration::from_millis(1000)).is_some());
    }

    #[test]
    fn test_manual_cancel() {
        let mut scheduler = ManualScheduler::new();
        let handle = scheduler.schedule_after(Duration::ZERO, TimerKind::RetryCooldown);
        assert!(scheduler.is_pending(handle));
        scheduler.cancel(handle);
        assert!(!scheduler.is_pending(handle));
        assert!(scheduler.pop_due(Duration::from_secs(1)).is_none());

        scheduler.schedule_after(Duration::ZERO, TimerKind::RetryCooldown);
        scheduler.schedule_after(Duration::ZERO, TimerKind::Settle { sequence: 3 });
        scheduler.cancel_all();
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_manual_delay_is_relative_to_now() {
        let mut scheduler = ManualScheduler::new();
        scheduler.set_now(Duration::from_millis(250));
        scheduler.schedule_after(Duration::from_millis(100), TimerKind::RetryCooldown);
        assert_eq!(scheduler.next_due(), Some(Duration::from_millis(350)));
        scheduler.set_now(Duration::from_millis(10));
        assert_eq!(scheduler.now(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_delivers_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        let handle = scheduler.schedule_after(Duration::from_millis(50), TimerKind::RetryCooldown);

        let fired = rx.recv().await;
        assert_eq!(
            fired,
            Some(TimerFired {
                handle,
                kind: TimerKind::RetryCooldown,
            })
        );
        assert!(scheduler.complete(handle));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel_suppresses_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        let settle = TimerKind::Settle { sequence: 1 };
        let cancelled = scheduler.schedule_after(Duration::from_millis(10), settle);
        let kept = scheduler.schedule_after(Duration::from_millis(20), TimerKind::RetryCooldown);
        scheduler.cancel(cancelled);

        let fired = rx.recv().await;
        assert_eq!(fired.map(|fired| fired.handle), Some(kept));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_deadline_is_fixed_at_schedule_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        let start = tokio::time::Instant::now();
        let delay = Duration::from_millis(100);
        let handle = scheduler.schedule_after(delay, TimerKind::RetryCooldown);

        // The timer task has not run yet when the clock moves.
        tokio::time::advance(delay).await;
        let fired = rx.recv().await;

        assert_eq!(fired.map(|fired| fired.handle), Some(handle));
        assert_eq!(start.elapsed(), delay);
    }
}
