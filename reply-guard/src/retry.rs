//! Retry state machine.
//!
//! The controller keeps one retry budget per reply slot. An invalid reply
//! arms a cooldown timer; when it fires the host is asked to regenerate the
//! same slot. The attempt counter is bumped when the timer is armed, before
//! the regenerate action runs, so an action that keeps failing still burns
//! through the budget instead of re-firing forever.

use std::time::Duration;

use serde::Serialize;

use crate::config::RetrySettings;
use crate::conversation::SlotId;
use crate::scheduler::Scheduler;
use crate::scheduler::TimerHandle;
use crate::scheduler::TimerKind;
use crate::session::SlotObservation;
use crate::validity::ValidityPredicate;

/// Retry memory for the supervising session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub retry_count: u32,
    pub last_slot: Option<SlotId>,
    pub suppressed_by_manual_override: bool,
    pub pending_retry_timer: Option<TimerHandle>,
    pub generation_in_flight: bool,
    /// Slot whose exhausted budget has already been reported.
    pub exhausted_reported_for: Option<SlotId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPhase {
    Idle,
    AwaitingRetryTimer,
    Suppressed,
}

impl RetryState {
    pub fn phase(&self) -> RetryPhase {
        if self.suppressed_by_manual_override {
            RetryPhase::Suppressed
        } else if self.pending_retry_timer.is_some() {
            RetryPhase::AwaitingRetryTimer
        } else {
            RetryPhase::Idle
        }
    }
}

/// Outcome of evaluating one observed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Auto-retry is switched off.
    Disabled,
    /// A manual regeneration froze auto-retry.
    Suppressed,
    /// The reply is valid; the budget was reset.
    Accepted,
    /// A retry is already waiting on its cooldown.
    AlreadyScheduled,
    /// No attempts left for this slot. `report` is true only the first time
    /// this is seen for the slot.
    BudgetExhausted { report: bool },
    /// Another generation is running; its result will be evaluated instead.
    AwaitingGeneration,
    /// A regeneration is queued.
    Scheduled { attempt: u32, delay: Duration },
}

/// Why a fired cooldown did not regenerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Suppressed,
}

/// Outcome of a fired cooldown timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFire {
    /// The timer was cancelled or superseded.
    Stale,
    /// Settings changed during the cooldown.
    Skipped(SkipReason),
    /// The host should regenerate now.
    Regenerate { slot: SlotId, attempt: u32 },
}

#[derive(Debug, Default)]
pub struct RetryController {
    state: RetryState,
}

impl RetryController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Generation-ended arrived but the reply is not known yet.
    pub fn mark_generation_finished(&mut self) {
        self.state.generation_in_flight = false;
    }

    /// A new generation supersedes any retry waiting on its cooldown.
    pub fn on_generation_started(&mut self, scheduler: &mut dyn Scheduler) {
        self.state.generation_in_flight = true;
        self.cancel_pending(scheduler);
    }

    /// Evaluates the text observed at a slot and decides whether to retry.
    pub fn on_reply_observed(
        &mut self,
        observation: &SlotObservation,
        settings: &RetrySettings,
        predicate: &ValidityPredicate,
        scheduler: &mut dyn Scheduler,
    ) -> RetryDecision {
        self.state.generation_in_flight = observation.generation_in_flight;

        if !settings.enabled {
            self.cancel_pending(scheduler);
            return RetryDecision::Disabled;
        }
        if settings.stop_on_manual_regen && self.state.suppressed_by_manual_override {
            tracing::debug!(target: "reply_guard::retry", slot = %observation.slot, "auto-retry suppressed by manual regeneration");
            return RetryDecision::Suppressed;
        }

        if self.state.last_slot.as_ref() != Some(&observation.slot) {
            tracing::debug!(target: "reply_guard::retry", slot = %observation.slot, "tracking new slot");
            self.state.retry_count = 0;
            self.state.last_slot = Some(observation.slot.clone());
            self.cancel_pending(scheduler);
        }

        if predicate.is_valid(&observation.text) {
            tracing::info!(target: "reply_guard::retry", slot = %observation.slot, "reply accepted");
            self.state.retry_count = 0;
            self.state.exhausted_reported_for = None;
            self.cancel_pending(scheduler);
            return RetryDecision::Accepted;
        }

        if self.state.pending_retry_timer.is_some() {
            return RetryDecision::AlreadyScheduled;
        }

        if self.state.retry_count >= settings.max_retries {
            let report = self.state.exhausted_reported_for.as_ref() != Some(&observation.slot);
            if report {
                tracing::warn!(
                    target: "reply_guard::retry",
                    slot = %observation.slot,
                    max_retries = settings.max_retries,
                    "max retries reached"
                );
                self.state.exhausted_reported_for = Some(observation.slot.clone());
            }
            return RetryDecision::BudgetExhausted { report };
        }

        if self.state.generation_in_flight {
            tracing::debug!(target: "reply_guard::retry", slot = %observation.slot, "invalid reply while a generation is running; waiting");
            return RetryDecision::AwaitingGeneration;
        }

        self.state.retry_count += 1;
        let delay = settings.cooldown();
        let handle = scheduler.schedule_after(delay, TimerKind::RetryCooldown);
        self.state.pending_retry_timer = Some(handle);
        tracing::info!(
            target: "reply_guard::retry",
            slot = %observation.slot,
            attempt = self.state.retry_count,
            max_retries = settings.max_retries,
            delay_ms = delay.as_millis() as u64,
            "invalid reply, retry scheduled"
        );
        RetryDecision::Scheduled {
            attempt: self.state.retry_count,
            delay,
        }
    }

    /// Handles a fired cooldown. Settings are re-read because they may have
    /// changed while waiting.
    pub fn on_retry_timer(&mut self, handle: TimerHandle, settings: &RetrySettings) -> RetryFire {
        if self.state.pending_retry_timer != Some(handle) {
            return RetryFire::Stale;
        }
        self.state.pending_retry_timer = None;

        if !settings.enabled {
            tracing::debug!(target: "reply_guard::retry", "retry disabled during cooldown");
            return RetryFire::Skipped(SkipReason::Disabled);
        }
        if settings.stop_on_manual_regen && self.state.suppressed_by_manual_override {
            tracing::debug!(target: "reply_guard::retry", "retry suppressed during cooldown");
            return RetryFire::Skipped(SkipReason::Suppressed);
        }
        match &self.state.last_slot {
            Some(slot) => RetryFire::Regenerate {
                slot: slot.clone(),
                attempt: self.state.retry_count,
            },
            None => RetryFire::Stale,
        }
    }

    /// Freezes auto-retry until the next reset. Returns false when the
    /// settings do not honour manual overrides.
    pub fn on_manual_override(
        &mut self,
        settings: &RetrySettings,
        scheduler: &mut dyn Scheduler,
    ) -> bool {
        if !settings.stop_on_manual_regen {
            return false;
        }
        tracing::info!(target: "reply_guard::retry", "manual regeneration, auto-retry suppressed until next user message");
        self.state.suppressed_by_manual_override = true;
        self.state.retry_count = 0;
        self.cancel_pending(scheduler);
        true
    }

    /// Clears all retry memory. Used for new user turns and chat switches.
    pub fn reset(&mut self, scheduler: &mut dyn Scheduler) {
        self.cancel_pending(scheduler);
        self.state = RetryState::default();
    }

    fn cancel_pending(&mut self, scheduler: &mut dyn Scheduler) {
        if let Some(handle) = self.state.pending_retry_timer.take() {
            scheduler.cancel(handle);
        }
    }
}
