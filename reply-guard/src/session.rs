//! Generation session tracking.
//!
//! Hosts report the end of a generation in two unreliable ways: a
//! generation-ended notification that may arrive before the reply body is
//! written, and a per-index content-rendered notification that some pipeline
//! paths send instead. The tracker remembers which slot the current attempt
//! is expected to fill and turns either signal into one [`SlotObservation`].
//!
//! Every session carries a sequence number. A settle timer captures it when
//! armed and is discarded if a newer session has started by the time it
//! fires.

use std::time::Duration;

use crate::conversation::ConversationSnapshot;
use crate::conversation::SlotId;
use crate::scheduler::Scheduler;
use crate::scheduler::TimerHandle;
use crate::scheduler::TimerKind;

/// Which notification produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationSource {
    GenerationEnded,
    SettleElapsed,
    ContentRendered,
}

/// Normalized "the text at this slot is now known" event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotObservation {
    pub slot: SlotId,
    /// Empty when the slot never materialized.
    pub text: String,
    /// Whether a generation is still running after this notification.
    pub generation_in_flight: bool,
    pub source: ObservationSource,
}

/// State of the current generation attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSession {
    pub sequence: u64,
    /// Slot the running (or last) generation is expected to fill.
    pub target: Option<SlotId>,
    pub in_flight: bool,
    pub settle_timer: Option<TimerHandle>,
}

#[derive(Debug)]
pub struct GenerationSessionTracker {
    session: GenerationSession,
    settle_delay: Duration,
}

impl GenerationSessionTracker {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            session: GenerationSession::default(),
            settle_delay,
        }
    }

    pub fn session(&self) -> &GenerationSession {
        &self.session
    }

    pub fn sequence(&self) -> u64 {
        self.session.sequence
    }

    pub fn target(&self) -> Option<&SlotId> {
        self.session.target.as_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.session.in_flight
    }

    pub fn is_settle_pending(&self) -> bool {
        self.session.settle_timer.is_some()
    }

    /// Starts a new session and resolves the slot it should fill.
    pub fn begin(
        &mut self,
        conversation: &ConversationSnapshot,
        scheduler: &mut dyn Scheduler,
    ) -> SlotId {
        self.cancel_settle(scheduler);
        self.session.sequence += 1;
        let target = conversation.slot(conversation.expected_reply_index());
        tracing::debug!(
            target: "reply_guard::session",
            sequence = self.session.sequence,
            slot = %target,
            "generation started"
        );
        self.session.target = Some(target.clone());
        self.session.in_flight = true;
        target
    }

    /// Handles generation-ended. Returns an observation right away when the
    /// target already has text, otherwise arms the settle timer.
    pub fn on_generation_ended(
        &mut self,
        conversation: &ConversationSnapshot,
        scheduler: &mut dyn Scheduler,
    ) -> Option<SlotObservation> {
        self.session.in_flight = false;

        let target = match &self.session.target {
            Some(target) => target.clone(),
            None => {
                // Ended without a started notification: fall back to the
                // trailing reply, if there is one.
                let (index, entry) = conversation.last_turn()?;
                if !entry.is_reply() {
                    tracing::debug!(target: "reply_guard::session", "generation ended with no reply to observe");
                    return None;
                }
                let slot = conversation.slot(index);
                self.session.target = Some(slot.clone());
                slot
            }
        };

        if target.conversation_id != conversation.conversation_id {
            tracing::debug!(target: "reply_guard::session", slot = %target, "ignoring generation end for another conversation");
            return None;
        }

        self.cancel_settle(scheduler);
        let materialized = conversation
            .entry(target.index)
            .is_some_and(|entry| entry.is_materialized_reply());
        if materialized {
            let source = ObservationSource::GenerationEnded;
            return Some(self.observation(conversation, target, source));
        }

        let settle = TimerKind::Settle {
            sequence: self.session.sequence,
        };
        let handle = scheduler.schedule_after(self.settle_delay, settle);
        tracing::debug!(
            target: "reply_guard::session",
            sequence = self.session.sequence,
            slot = %target,
            delay_ms = self.settle_delay.as_millis() as u64,
            "reply not materialized yet, waiting to settle"
        );
        self.session.settle_timer = Some(handle);
        None
    }

    /// Handles a fired settle timer. Stale timers yield nothing; otherwise
    /// whatever sits in the target slot is observed, empty if nothing does.
    pub fn on_settle_elapsed(
        &mut self,
        handle: TimerHandle,
        sequence: u64,
        conversation: &ConversationSnapshot,
    ) -> Option<SlotObservation> {
        if sequence != self.session.sequence || self.session.settle_timer != Some(handle) {
            tracing::debug!(
                target: "reply_guard::session",
                sequence,
                current = self.session.sequence,
                "discarding stale settle timer"
            );
            return None;
        }
        self.session.settle_timer = None;

        let target = self.session.target.clone()?;
        if target.conversation_id != conversation.conversation_id {
            return None;
        }
        let source = ObservationSource::SettleElapsed;
        let observation = self.observation(conversation, target, source);
        if observation.text.is_empty() {
            tracing::debug!(target: "reply_guard::session", slot = %observation.slot, "slot still empty after settle");
        }
        Some(observation)
    }

    /// Handles content-rendered at `index`. Only the newest reply of the
    /// conversation is accepted; older or out-of-range indices are ignored.
    pub fn on_content_rendered(
        &mut self,
        index: usize,
        conversation: &ConversationSnapshot,
        scheduler: &mut dyn Scheduler,
    ) -> Option<SlotObservation> {
        if index >= conversation.entries.len() {
            tracing::debug!(target: "reply_guard::session", index, "ignoring render outside conversation bounds");
            return None;
        }
        if !conversation.is_latest_reply(index) {
            tracing::debug!(target: "reply_guard::session", index, "ignoring render of superseded or non-reply entry");
            return None;
        }

        let slot = conversation.slot(index);
        if self.session.target.as_ref() == Some(&slot) {
            self.cancel_settle(scheduler);
            self.session.in_flight = false;
        }
        let source = ObservationSource::ContentRendered;
        Some(self.observation(conversation, slot, source))
    }

    /// Drops the current session. Pending settles become stale.
    pub fn reset(&mut self, scheduler: &mut dyn Scheduler) {
        self.cancel_settle(scheduler);
        self.session.sequence += 1;
        self.session.target = None;
        self.session.in_flight = false;
    }

    fn cancel_settle(&mut self, scheduler: &mut dyn Scheduler) {
        if let Some(handle) = self.session.settle_timer.take() {
            scheduler.cancel(handle);
        }
    }

    fn observation(
        &self,
        conversation: &ConversationSnapshot,
        slot: SlotId,
        source: ObservationSource,
    ) -> SlotObservation {
        let text = conversation.reply_text(&slot).unwrap_or_default();
        SlotObservation {
            slot,
            text: text.to_string(),
            generation_in_flight: self.session.in_flight,
            source,
        }
    }
}
