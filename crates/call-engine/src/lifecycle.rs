//! Call lifecycle state machine.
//!
//! A pure transition function over the [`Call`] record. The per-call
//! task feeds it switch events and local commands; it never performs
//! I/O itself, which keeps every transition unit-testable.
//!
//! Invalid inputs for the current state are logged as conflicts and
//! ignored. A call never crashes on a stray event, and terminal states
//! (`Ended`, `Failed`) are absorbing: duplicates of already-applied
//! events are no-ops.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::call::{Call, CallOutcome, CallState};

/// Inputs driving lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleInput {
    /// Local dial request; the task issues the Originate action.
    DialRequested,
    /// The switch accepted the Originate action.
    OriginateAccepted,
    /// The switch rejected the Originate action.
    OriginateRejected { reason: String },
    /// `Newchannel` bound a switch channel to this call.
    ChannelCreated { channel: String },
    /// Ringing progress reported by the switch.
    Progress,
    /// The far end answered.
    Answered,
    /// First media playback was acknowledged; the audio path works.
    MediaReady,
    /// Local hangup command.
    HangupRequested,
    /// The switch reported the channel hung up.
    HangupEvent { cause: Option<String> },
    /// Some other channel event (bridge enter/leave); only proves the
    /// call is still alive.
    ChannelActivity,
    /// No channel activity for the configured stall window.
    StallTimeout,
    /// The management connection dropped; switch-side state is
    /// unknowable, so the call cannot be confirmed.
    ConnectionLost,
    /// Grace period expired while still in `Ending`.
    Finalize,
}

impl LifecycleInput {
    /// Whether this input originated from the switch (and thus counts
    /// as channel activity for stall detection).
    fn is_switch_activity(&self) -> bool {
        matches!(
            self,
            LifecycleInput::OriginateAccepted
                | LifecycleInput::ChannelCreated { .. }
                | LifecycleInput::Progress
                | LifecycleInput::Answered
                | LifecycleInput::HangupEvent { .. }
                | LifecycleInput::ChannelActivity
        )
    }
}

/// Result of applying one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The state changed.
    Changed { from: CallState, to: CallState },
    /// The input was absorbed without a state change (duplicate,
    /// conflict, or pure activity).
    Ignored,
}

/// Apply one input to the call, returning what happened.
pub fn apply(call: &mut Call, input: LifecycleInput) -> Transition {
    if input.is_switch_activity() {
        call.last_event_at = Utc::now();
    }

    if call.state.is_terminal() {
        // Duplicate terminal events are expected noise; anything else
        // is a conflict worth flagging.
        match input {
            LifecycleInput::HangupEvent { .. }
            | LifecycleInput::ChannelActivity
            | LifecycleInput::ConnectionLost
            | LifecycleInput::Finalize => {
                debug!("call {}: {:?} after terminal state, no-op", call.id, input)
            }
            _ => conflict(call, &input),
        }
        return Transition::Ignored;
    }

    let from = call.state;
    match (from, input) {
        (CallState::Idle, LifecycleInput::DialRequested) => to(call, CallState::Dialing),

        (CallState::Dialing, LifecycleInput::OriginateAccepted) => Transition::Ignored,
        (CallState::Dialing, LifecycleInput::OriginateRejected { reason }) => {
            info!("call {}: originate rejected: {}", call.id, reason);
            fail(call, CallOutcome::Rejected)
        }
        (CallState::Dialing | CallState::Ringing, LifecycleInput::ChannelCreated { channel }) => {
            debug!("call {}: channel bound: {}", call.id, channel);
            call.channel = Some(channel);
            Transition::Ignored
        }
        (CallState::Dialing | CallState::Ringing, LifecycleInput::Progress) => {
            if from == CallState::Ringing {
                Transition::Ignored
            } else {
                to(call, CallState::Ringing)
            }
        }
        (CallState::Dialing | CallState::Ringing, LifecycleInput::Answered) => {
            call.answered_at = Some(Utc::now());
            to(call, CallState::Answered)
        }
        (CallState::Dialing | CallState::Ringing, LifecycleInput::StallTimeout) => {
            info!("call {}: no channel activity, giving up", call.id);
            fail(call, CallOutcome::NoAnswer)
        }
        (CallState::Dialing | CallState::Ringing, LifecycleInput::HangupEvent { cause }) => {
            let outcome = pre_answer_outcome(cause.as_deref());
            call.hangup_cause = cause;
            fail(call, outcome)
        }
        (CallState::Dialing | CallState::Ringing, LifecycleInput::HangupRequested) => {
            call.outcome = Some(CallOutcome::Canceled);
            to(call, CallState::Ending)
        }

        (CallState::Answered, LifecycleInput::MediaReady) => to(call, CallState::InProgress),
        (CallState::InProgress, LifecycleInput::MediaReady) => Transition::Ignored,

        (CallState::Answered | CallState::InProgress, LifecycleInput::HangupRequested) => {
            to(call, CallState::Ending)
        }
        (CallState::Answered | CallState::InProgress, LifecycleInput::HangupEvent { cause }) => {
            call.hangup_cause = cause;
            end(call)
        }

        (CallState::Ending, LifecycleInput::HangupEvent { cause }) => {
            call.hangup_cause = cause;
            end(call)
        }
        (CallState::Ending, LifecycleInput::Finalize) => end(call),
        (CallState::Ending, LifecycleInput::ConnectionLost) => {
            warn!(
                "call {}: connection lost while ending, hangup delivery unconfirmed",
                call.id
            );
            fail(call, CallOutcome::ConnectionLost)
        }
        (CallState::Ending, _input) => {
            // Trailing events are exactly what Ending exists to absorb.
            Transition::Ignored
        }

        (_, LifecycleInput::ConnectionLost) => {
            warn!(
                "call {}: connection lost in state {}, cannot confirm switch-side state",
                call.id, from
            );
            fail(call, CallOutcome::ConnectionLost)
        }
        (_, LifecycleInput::ChannelActivity) => Transition::Ignored,

        (_, input) => {
            conflict(call, &input);
            Transition::Ignored
        }
    }
}

fn to(call: &mut Call, state: CallState) -> Transition {
    let from = call.state;
    call.state = state;
    debug!("call {}: {} -> {}", call.id, from, state);
    Transition::Changed { from, to: state }
}

fn fail(call: &mut Call, outcome: CallOutcome) -> Transition {
    call.outcome = Some(outcome);
    call.ended_at = Some(Utc::now());
    to(call, CallState::Failed)
}

fn end(call: &mut Call) -> Transition {
    if call.outcome.is_none() {
        call.outcome = Some(CallOutcome::Completed);
    }
    call.ended_at = Some(Utc::now());
    to(call, CallState::Ended)
}

fn conflict(call: &Call, input: &LifecycleInput) {
    warn!(
        "call {}: input {:?} conflicts with state {}, ignored",
        call.id, input, call.state
    );
}

/// Classify a hangup that happened before answer. ISDN cause 17 is
/// user busy; everything else counts as no answer.
fn pre_answer_outcome(cause: Option<&str>) -> CallOutcome {
    match cause {
        Some("17") => CallOutcome::Busy,
        _ => CallOutcome::NoAnswer,
    }
}
