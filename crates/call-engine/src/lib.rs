//! Outbound call orchestration.
//!
//! One [`CallManager`] owns the registry of active calls. Each call
//! pairs two state machines: the [lifecycle](lifecycle) machine tracks
//! telephony progress (dialing, ringing, answered, ended) from switch
//! events, and the [conversation](conversation) machine consumes
//! recognized utterances plus emotion signals to pick the next spoken
//! turn. A [human-timing gate](timing) delays each turn so the agent
//! doesn't answer with machine reflexes.
//!
//! Concurrency model: the AMI client's read loop feeds a router task
//! that maps switch events onto per-call input queues. Every call runs
//! its own task consuming that queue, so processing within a call is
//! strictly in arrival order while calls never block each other.
//! Speech recognition, synthesis, and storage are collaborators behind
//! the traits in [`collaborators`]; the engine never blocks a call on
//! storage and degrades gracefully when speech services fail.

pub mod call;
pub mod collaborators;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod timing;

pub use call::{Call, CallId, CallOutcome, CallSnapshot, CallState};
pub use collaborators::{
    AudioRef, CallRecord, CallStore, RecognitionResult, SpeechRecognizer, SpeechSynthesizer,
};
pub use config::{DialRequest, EngineConfig};
pub use conversation::{
    ConversationContext, ConversationState, Decision, EmotionSignal, SpokenTurn, Turn,
    TurnCategory,
};
pub use error::{EngineError, Result};
pub use events::EngineNotification;
pub use manager::{CallManager, EngineServices};
pub use timing::{TimingConfig, TimingGate};
