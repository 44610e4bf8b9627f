//! Wiring between host notifications and the guard components.
//!
//! [`ReplyGuardRuntime`] owns every piece of mutable state and runs each
//! transition to completion inside a single call, so no locking is needed.
//! Timers come back in through [`ReplyGuardRuntime::on_timer`]; whoever owns
//! the scheduler is responsible for delivering them.

use std::time::Duration;

use serde::Serialize;

use crate::config::CooperatingSettings;
use crate::config::GuardConfig;
use crate::config::RetrySettings;
use crate::conversation::ConversationSnapshot;
use crate::conversation::SlotId;
use crate::error::Result;
use crate::events::ReplyGuardEvent;
use crate::events::ReplyGuardEventSender;
use crate::gate::AllowReason;
use crate::gate::AutoContinueGate;
use crate::gate::GateContext;
use crate::gate::GateDecision;
use crate::gate::SendAttempt;
use crate::retry::RetryController;
use crate::retry::RetryDecision;
use crate::retry::RetryFire;
use crate::retry::RetryPhase;
use crate::scheduler::ManualScheduler;
use crate::scheduler::Scheduler;
use crate::scheduler::TimerFired;
use crate::scheduler::TimerKind;
use crate::session::GenerationSessionTracker;
use crate::session::SlotObservation;
use crate::validity::ValidityPredicate;

/// Everything the guard needs from the host application.
pub trait HostBridge {
    /// Current chat state. Called on every notification; never mutated.
    fn conversation(&self) -> ConversationSnapshot;

    /// Retry settings, read fresh at every decision point.
    fn retry_settings(&self) -> RetrySettings;

    /// Settings of the cooperating automation, if it is installed.
    fn cooperating_settings(&self) -> Option<CooperatingSettings>;

    /// Asks the pipeline to generate the current reply again.
    fn regenerate(&mut self) -> anyhow::Result<()>;
}

/// Host notifications the guard reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostNotification {
    GenerationStarted,
    GenerationEnded,
    ContentRendered { index: usize },
    UserMessageSent,
    ConversationChanged,
}

impl HostNotification {
    pub fn kind(self) -> &'static str {
        match self {
            Self::GenerationStarted => "generation_started",
            Self::GenerationEnded => "generation_ended",
            Self::ContentRendered { .. } => "content_rendered",
            Self::UserMessageSent => "user_message_sent",
            Self::ConversationChanged => "conversation_changed",
        }
    }
}

/// Point-in-time view of the guard for host UIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyGuardStatus {
    pub phase: RetryPhase,
    pub retry_count: u32,
    pub last_slot: Option<SlotId>,
    pub retry_pending: bool,
    pub generation_in_flight: bool,
    pub settle_pending: bool,
    pub session_sequence: u64,
    pub observed_slot: Option<SlotId>,
    pub consumed_for_slot: Option<SlotId>,
    pub disposed: bool,
}

pub struct ReplyGuardRuntime<H: HostBridge, S: Scheduler> {
    host: H,
    scheduler: S,
    predicate: ValidityPredicate,
    tracker: GenerationSessionTracker,
    retry: RetryController,
    gate: AutoContinueGate,
    events: ReplyGuardEventSender,
    disposed: bool,
}

impl<H: HostBridge, S: Scheduler> ReplyGuardRuntime<H, S> {
    pub fn new(
        host: H,
        scheduler: S,
        config: &GuardConfig,
        events: ReplyGuardEventSender,
    ) -> Result<Self> {
        Ok(Self {
            host,
            scheduler,
            predicate: ValidityPredicate::new(&config.tags)?,
            tracker: GenerationSessionTracker::new(config.settle_delay()),
            retry: RetryController::new(),
            gate: AutoContinueGate::new(),
            events,
            disposed: false,
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn predicate(&self) -> &ValidityPredicate {
        &self.predicate
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn handle_notification(&mut self, notification: HostNotification) {
        if self.disposed {
            return;
        }
        tracing::debug!(target: "reply_guard::runtime", notification = notification.kind(), "host notification");
        match notification {
            HostNotification::GenerationStarted => {
                let conversation = self.host.conversation();
                self.tracker.begin(&conversation, &mut self.scheduler);
                self.retry.on_generation_started(&mut self.scheduler);
            }
            HostNotification::GenerationEnded => {
                let conversation = self.host.conversation();
                match self
                    .tracker
                    .on_generation_ended(&conversation, &mut self.scheduler)
                {
                    Some(observation) => self.apply_observation(observation),
                    None => self.retry.mark_generation_finished(),
                }
            }
            HostNotification::ContentRendered { index } => {
                let conversation = self.host.conversation();
                if let Some(observation) = self
                    .tracker
                    .on_content_rendered(index, &conversation, &mut self.scheduler)
                {
                    self.apply_observation(observation);
                }
            }
            HostNotification::UserMessageSent | HostNotification::ConversationChanged => {
                self.reset();
            }
        }
    }

    pub fn on_timer(&mut self, fired: TimerFired) {
        if self.disposed {
            return;
        }
        match fired.kind {
            TimerKind::RetryCooldown => {
                let settings = self.host.retry_settings();
                if let RetryFire::Regenerate { slot, attempt } =
                    self.retry.on_retry_timer(fired.handle, &settings)
                {
                    self.regenerate(slot, attempt);
                }
            }
            TimerKind::Settle { sequence } => {
                let conversation = self.host.conversation();
                if let Some(observation) = self
                    .tracker
                    .on_settle_elapsed(fired.handle, sequence, &conversation)
                {
                    self.apply_observation(observation);
                }
            }
        }
    }

    /// Decides a send attempt of the cooperating automation, with the reason.
    pub fn decide_send(&mut self, attempt: &SendAttempt) -> GateDecision {
        if self.disposed {
            return GateDecision::Allow(AllowReason::NotAutoContinue);
        }
        let cooperating = match &attempt.cooperating {
            Some(settings) => Some(settings.clone()),
            None => self.host.cooperating_settings(),
        };
        let conversation = self.host.conversation();
        let ctx = GateContext {
            generation_in_flight: self.tracker.is_in_flight(),
            settle_pending: self.tracker.is_settle_pending(),
            conversation: &conversation,
            predicate: &self.predicate,
        };
        let decision = self.gate.decide(
            attempt.is_trusted,
            &attempt.message_text,
            cooperating.as_ref(),
            ctx,
        );
        match decision {
            GateDecision::Block(reason) => {
                self.events.send(ReplyGuardEvent::AutoContinueBlocked { reason });
            }
            GateDecision::Allow(AllowReason::FirstValidSend) => {
                if let Some(slot) = self.gate.state().consumed_for_slot.clone() {
                    self.events.send(ReplyGuardEvent::AutoContinueAllowed { slot });
                }
            }
            GateDecision::Allow(_) => {}
        }
        decision
    }

    /// Returns true when the cooperating automation must not send.
    pub fn evaluate_send(&mut self, attempt: &SendAttempt) -> bool {
        self.decide_send(attempt).is_blocked()
    }

    /// Reports that the user regenerated by hand.
    pub fn notify_manual_override(&mut self) {
        if self.disposed {
            return;
        }
        let settings = self.host.retry_settings();
        if self
            .retry
            .on_manual_override(&settings, &mut self.scheduler)
        {
            self.events.send(ReplyGuardEvent::RetriesSuppressed);
        }
    }

    /// Cancels every timer and stops reacting to notifications. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.tracker.reset(&mut self.scheduler);
        self.retry.reset(&mut self.scheduler);
        self.gate.reset();
        self.scheduler.cancel_all();
        self.disposed = true;
        tracing::debug!(target: "reply_guard::runtime", "reply guard disposed");
    }

    pub fn status(&self) -> ReplyGuardStatus {
        let retry = self.retry.state();
        let gate = self.gate.state();
        ReplyGuardStatus {
            phase: retry.phase(),
            retry_count: retry.retry_count,
            last_slot: retry.last_slot.clone(),
            retry_pending: retry.pending_retry_timer.is_some(),
            generation_in_flight: self.tracker.is_in_flight(),
            settle_pending: self.tracker.is_settle_pending(),
            session_sequence: self.tracker.sequence(),
            observed_slot: gate.observed_slot.clone(),
            consumed_for_slot: gate.consumed_for_slot.clone(),
            disposed: self.disposed,
        }
    }

    fn reset(&mut self) {
        self.tracker.reset(&mut self.scheduler);
        self.retry.reset(&mut self.scheduler);
        self.gate.reset();
    }

    fn apply_observation(&mut self, observation: SlotObservation) {
        let settings = self.host.retry_settings();
        self.gate.observe(&observation, &self.predicate);
        let decision = self.retry.on_reply_observed(
            &observation,
            &settings,
            &self.predicate,
            &mut self.scheduler,
        );
        let slot = observation.slot;
        match decision {
            RetryDecision::Scheduled { attempt, delay } => {
                self.events.send(ReplyGuardEvent::RetryScheduled {
                    slot,
                    attempt,
                    max_retries: settings.max_retries,
                    delay,
                });
            }
            RetryDecision::Accepted => {
                self.events.send(ReplyGuardEvent::ReplyAccepted { slot });
            }
            RetryDecision::BudgetExhausted { report: true } => {
                self.events.send(ReplyGuardEvent::MaxRetriesReached {
                    slot,
                    max_retries: settings.max_retries,
                });
            }
            RetryDecision::BudgetExhausted { report: false }
            | RetryDecision::Disabled
            | RetryDecision::Suppressed
            | RetryDecision::AlreadyScheduled
            | RetryDecision::AwaitingGeneration => {}
        }
    }

    // The slot stays idle until the host reports GenerationStarted. A render
    // or generation end for the still-invalid slot in that gap arms the next
    // attempt; the start then cancels it and the attempt stays counted.
    fn regenerate(&mut self, slot: SlotId, attempt: u32) {
        tracing::info!(target: "reply_guard::runtime", slot = %slot, attempt, "requesting regeneration");
        self.events.send(ReplyGuardEvent::RegenerateRequested {
            slot: slot.clone(),
            attempt,
        });
        if let Err(err) = self.host.regenerate() {
            tracing::warn!(target: "reply_guard::runtime", slot = %slot, attempt, "regenerate action failed: {err:#}");
            self.events.send(ReplyGuardEvent::RegenerateFailed {
                slot,
                attempt,
                error: format!("{err:#}"),
            });
        }
    }
}

impl<H: HostBridge> ReplyGuardRuntime<H, ManualScheduler> {
    /// Moves the virtual clock forward, firing due timers in order. Timers
    /// armed by earlier callbacks fire too if they fall inside the window.
    pub fn advance(&mut self, by: Duration) {
        let deadline = self.scheduler.now().saturating_add(by);
        while let Some(fired) = self.scheduler.pop_due(deadline) {
            self.on_timer(fired);
        }
        self.scheduler.set_now(deadline);
    }

    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }
}

impl<H: HostBridge, S: Scheduler> Drop for ReplyGuardRuntime<H, S> {
    fn drop(&mut self) {
        self.dispose();
    }
}
