//! Call data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Locally assigned call identifier.
///
/// Assigned before dialing; the switch's channel name is bound to it
/// once the `Newchannel` event arrives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telephony progress of a call.
///
/// `Ended` and `Failed` are terminal: no input ever transitions a call
/// out of them. `Ending` absorbs trailing switch events for a short
/// window so they cannot be misrouted to a newer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Answered,
    InProgress,
    Ending,
    Ended,
    Failed,
}

impl CallState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Whether the call is still waiting for the far end to pick up.
    pub fn is_pre_answer(&self) -> bool {
        matches!(self, CallState::Dialing | CallState::Ringing)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::InProgress => "in-progress",
            CallState::Ending => "ending",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome classification reported to the dashboard and storage
/// collaborators once a call reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    /// The conversation ran to completion.
    Completed,
    /// The far end never picked up (includes local stall timeout).
    NoAnswer,
    /// Busy signal.
    Busy,
    /// The switch rejected the originate request.
    Rejected,
    /// The management connection dropped mid-call; switch-side state
    /// could not be confirmed.
    ConnectionLost,
    /// Canceled locally before completion.
    Canceled,
    /// Any other switch-reported failure.
    Error,
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallOutcome::Completed => "completed",
            CallOutcome::NoAnswer => "no-answer",
            CallOutcome::Busy => "busy",
            CallOutcome::Rejected => "rejected",
            CallOutcome::ConnectionLost => "connection-lost",
            CallOutcome::Canceled => "canceled",
            CallOutcome::Error => "error",
        };
        f.write_str(s)
    }
}

/// One outbound call attempt.
///
/// Mutated only by its own lifecycle machine, inside that call's task.
#[derive(Debug, Clone)]
pub struct Call {
    pub id: CallId,
    /// Destination number as dialed.
    pub number: String,
    /// Switch channel name, bound once `Newchannel` arrives.
    pub channel: Option<String>,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Last time the switch told us anything about this call; drives
    /// the no-answer stall timeout.
    pub last_event_at: DateTime<Utc>,
    pub outcome: Option<CallOutcome>,
    /// Switch-reported hangup cause code, when one was given.
    pub hangup_cause: Option<String>,
}

impl Call {
    /// New call record in `Idle`, timestamped now.
    pub fn new(id: CallId, number: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            number: number.into(),
            channel: None,
            state: CallState::Idle,
            started_at: now,
            answered_at: None,
            ended_at: None,
            last_event_at: now,
            outcome: None,
            hangup_cause: None,
        }
    }

    /// Seconds from start to end, once ended.
    pub fn duration_secs(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_seconds())
    }

    /// Read-only view for external collaborators.
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            id: self.id.clone(),
            number: self.number.clone(),
            channel: self.channel.clone(),
            state: self.state,
            started_at: self.started_at,
            answered_at: self.answered_at,
            ended_at: self.ended_at,
            outcome: self.outcome,
            hangup_cause: self.hangup_cause.clone(),
        }
    }
}

/// Serializable snapshot handed to the dashboard collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub id: CallId,
    pub number: String,
    pub channel: Option<String>,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<CallOutcome>,
    pub hangup_cause: Option<String>,
}
