//! Engine notifications.
//!
//! The manager publishes call progress on a broadcast channel for
//! dashboards and supervisors. Slow receivers lag and lose the oldest
//! entries; the engine never blocks on them.

use serde::{Deserialize, Serialize};

use crate::call::{CallId, CallOutcome, CallState};
use crate::conversation::{ConversationState, SpokenTurn};

/// Progress notifications published by the [`CallManager`].
///
/// [`CallManager`]: crate::manager::CallManager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineNotification {
    /// A call changed lifecycle state.
    StateChanged {
        call_id: CallId,
        from: CallState,
        to: CallState,
    },
    /// A customer utterance was recognized.
    Heard {
        call_id: CallId,
        text: String,
    },
    /// The agent spoke a turn.
    Spoke {
        call_id: CallId,
        turn: SpokenTurn,
        conversation: ConversationState,
    },
    /// A turn was skipped because synthesis failed twice.
    TurnSkipped {
        call_id: CallId,
    },
    /// The call reached a terminal state.
    CallEnded {
        call_id: CallId,
        outcome: CallOutcome,
    },
    /// The management connection dropped.
    ConnectionDown,
    /// The management connection is back, with the new epoch.
    ConnectionUp {
        epoch: u64,
    },
}
