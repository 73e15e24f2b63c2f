//! External collaborator traits.
//!
//! Speech recognition, synthesis, and persistence are services the
//! engine orchestrates but does not implement. Each sits behind a
//! trait so tests can substitute scripted doubles, and so a failing
//! service degrades the call instead of crashing it:
//!
//! * recognition failure is treated as an empty utterance (the
//!   conversation asks for clarification),
//! * synthesis is retried once, then the turn is skipped with a
//!   warning,
//! * storage is fire-and-forget with one retry; a call never blocks on
//!   the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::CallSnapshot;
use crate::conversation::Turn;

/// Opaque handle to synthesized audio the switch can play back, e.g. a
/// sound-file path visible to the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef(pub String);

/// One recognized utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub text: String,
    pub language: String,
    /// Recognizer confidence in `0.0..=1.0`.
    pub confidence: f32,
}

#[derive(Debug, Error)]
#[error("recognition failed: {0}")]
pub struct RecognitionError(pub String);

#[derive(Debug, Error)]
#[error("synthesis failed: {0}")]
pub struct SynthesisError(pub String);

#[derive(Debug, Error)]
#[error("storage failed: {0}")]
pub struct StorageError(pub String);

/// Speech-to-text collaborator.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn recognize(&self, audio: AudioRef) -> Result<RecognitionResult, RecognitionError>;
}

/// Text-to-speech collaborator.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<AudioRef, SynthesisError>;
}

/// Completed-call record handed to storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call: CallSnapshot,
    pub transcript: Vec<Turn>,
    pub stored_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(call: CallSnapshot, transcript: Vec<Turn>) -> Self {
        Self {
            call,
            transcript,
            stored_at: Utc::now(),
        }
    }
}

/// Persistence collaborator for finished calls.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn store(&self, record: &CallRecord) -> Result<(), StorageError>;
}

/// Store that drops every record; the default when no persistence is
/// wired up.
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl CallStore for NullStore {
    async fn store(&self, _record: &CallRecord) -> Result<(), StorageError> {
        Ok(())
    }
}
