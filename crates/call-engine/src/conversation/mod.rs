//! Conversation state machine.
//!
//! One machine per call. It consumes recognized utterances plus the
//! emotion signal and decides the next spoken turn, following a fixed
//! priority: an explicit refusal always wins, a confident negative
//! emotion forces objection handling, then the state-scripted
//! progression applies, falling back to FAQ lookup and finally to a
//! clarification turn.
//!
//! The machine is pure dialogue logic: no I/O, no timers. The per-call
//! task feeds it and speaks its decisions.

pub mod emotion;
pub mod script;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use emotion::{EmotionLabel, EmotionSignal};
pub use script::{Faq, ScriptLibrary};

/// Dialogue progress of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationState {
    Greeting,
    Qualifying,
    Objection,
    Closing,
    Farewell,
    Ended,
}

/// Who said a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    Agent,
    Customer,
}

/// One entry in the turn history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
    pub emotion: Option<EmotionSignal>,
}

/// What kind of turn the machine chose; stable across the random
/// template variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnCategory {
    Greeting,
    Qualify,
    Pitch,
    ObjectionHandling,
    Closing,
    Faq,
    Clarification,
    Goodbye,
}

/// A rendered turn ready for the timing gate and synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpokenTurn {
    pub text: String,
    pub category: TurnCategory,
}

/// Outcome of one conversation step.
#[derive(Debug, Clone)]
pub struct Decision {
    /// State after the step.
    pub state: ConversationState,
    /// Turn to speak, if any.
    pub turn: Option<SpokenTurn>,
    /// Whether the call should be hung up after speaking.
    pub end_call: bool,
}

/// Per-call mutable dialogue state. Created with the call, destroyed
/// with it; the history is handed to storage at call end and never
/// pruned before that.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub state: ConversationState,
    pub history: Vec<Turn>,
    pub topic: Option<String>,
    pub slots: HashMap<String, String>,
}

impl ConversationContext {
    fn new(slots: HashMap<String, String>) -> Self {
        Self {
            state: ConversationState::Greeting,
            history: Vec::new(),
            topic: None,
            slots,
        }
    }
}

/// Phrases that mean the customer wants out; the campaign language
/// selects the table.
const REFUSALS_DE: &[&str] = &[
    "kein interesse",
    "nicht interessiert",
    "rufen sie nicht mehr an",
    "auflegen",
    "lassen sie mich in ruhe",
];
const REFUSALS_EN: &[&str] = &[
    "not interested",
    "no thanks",
    "stop calling",
    "leave me alone",
];

const AFFIRMATIVES_DE: &[&str] = &["ja", "gerne", "klar", "einverstanden", "in ordnung", "okay"];
const AFFIRMATIVES_EN: &[&str] = &["yes", "sure", "okay", "alright", "sounds good"];

/// The dialogue engine for one call.
pub struct ConversationMachine {
    ctx: ConversationContext,
    scripts: ScriptLibrary,
    emotion_threshold: f32,
    language: String,
    rng: SmallRng,
}

impl ConversationMachine {
    /// New machine with pre-seeded slot values (agent name, company,
    /// customer name where known). `language` picks the refusal and
    /// affirmative phrase tables.
    pub fn new(
        scripts: ScriptLibrary,
        slots: HashMap<String, String>,
        emotion_threshold: f32,
        language: impl Into<String>,
    ) -> Self {
        Self {
            ctx: ConversationContext::new(slots),
            scripts,
            emotion_threshold,
            language: language.into(),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.ctx.state
    }

    pub fn context(&self) -> &ConversationContext {
        &self.ctx
    }

    /// Take the accumulated history for the storage collaborator.
    pub fn take_history(&mut self) -> Vec<Turn> {
        std::mem::take(&mut self.ctx.history)
    }

    /// The call was answered: open with the greeting.
    pub fn on_answered(&mut self) -> SpokenTurn {
        self.ctx.state = ConversationState::Greeting;
        self.speak(TurnCategory::Greeting)
    }

    /// The call reached a terminal lifecycle state.
    pub fn on_call_ended(&mut self) {
        if self.ctx.state != ConversationState::Ended {
            debug!("conversation ended in state {:?}", self.ctx.state);
            self.ctx.state = ConversationState::Ended;
        }
    }

    /// Consume one recognized utterance and pick the next turn.
    pub fn advance(&mut self, text: &str, emotion: Option<EmotionSignal>) -> Decision {
        self.record(Speaker::Customer, text, emotion);
        let trimmed = text.trim();

        if matches!(
            self.ctx.state,
            ConversationState::Farewell | ConversationState::Ended
        ) {
            return self.decide(self.ctx.state, None, false);
        }

        // Priority 1: explicit refusal ends the conversation, no
        // matter what the emotion signal says.
        if !trimmed.is_empty() && is_refusal(&self.language, trimmed) {
            self.ctx.state = ConversationState::Farewell;
            let turn = self.speak(TurnCategory::Goodbye);
            return self.decide(ConversationState::Farewell, Some(turn), true);
        }

        // Priority 2: a confident negative emotion forces objection
        // handling from any state.
        if emotion.map_or(false, |e| e.requires_adaptation(self.emotion_threshold)) {
            self.ctx.state = ConversationState::Objection;
            let turn = self.speak(TurnCategory::ObjectionHandling);
            return self.decide(ConversationState::Objection, Some(turn), false);
        }

        // Empty recognition: ask again instead of guessing.
        if trimmed.is_empty() {
            let turn = self.speak(TurnCategory::Clarification);
            return self.decide(self.ctx.state, Some(turn), false);
        }

        // Priority 3: state-scripted progression.
        if let Some((next, category)) = self.scripted_step(trimmed) {
            self.ctx.state = next;
            let end = next == ConversationState::Farewell;
            let turn = self.speak(category);
            return self.decide(next, Some(turn), end);
        }

        // Priority 4: FAQ lookup.
        if let Some(answer) = self.scripts.faq_answer(trimmed) {
            let text = script::render(answer, &self.ctx.slots);
            let turn = SpokenTurn {
                text,
                category: TurnCategory::Faq,
            };
            self.record(Speaker::Agent, &turn.text, None);
            return self.decide(self.ctx.state, Some(turn), false);
        }

        // Priority 5: generic clarification.
        let turn = self.speak(TurnCategory::Clarification);
        self.decide(self.ctx.state, Some(turn), false)
    }

    /// The scripted progression for the current state, when the
    /// utterance drives one.
    fn scripted_step(&mut self, text: &str) -> Option<(ConversationState, TurnCategory)> {
        match self.ctx.state {
            // Any reply to the greeting moves into qualification.
            ConversationState::Greeting => {
                Some((ConversationState::Qualifying, TurnCategory::Qualify))
            }
            ConversationState::Qualifying => {
                if is_affirmative(&self.language, text) {
                    self.ctx.slots.insert("consent".into(), "yes".into());
                    self.ctx.topic = Some("closing".into());
                    Some((ConversationState::Closing, TurnCategory::Closing))
                } else if looks_like_question(text) {
                    // Let the FAQ table try first.
                    None
                } else {
                    self.ctx.topic = Some("product".into());
                    Some((ConversationState::Qualifying, TurnCategory::Pitch))
                }
            }
            ConversationState::Objection => {
                if is_affirmative(&self.language, text) {
                    Some((ConversationState::Qualifying, TurnCategory::Pitch))
                } else {
                    None
                }
            }
            ConversationState::Closing => {
                if is_affirmative(&self.language, text) {
                    self.ctx.slots.insert("consent".into(), "yes".into());
                    Some((ConversationState::Farewell, TurnCategory::Goodbye))
                } else {
                    None
                }
            }
            ConversationState::Farewell | ConversationState::Ended => None,
        }
    }

    /// Render a turn of the given category and record it as an agent
    /// turn.
    fn speak(&mut self, category: TurnCategory) -> SpokenTurn {
        let templates = match category {
            TurnCategory::Greeting => &self.scripts.greetings,
            TurnCategory::Qualify => &self.scripts.qualifying,
            TurnCategory::Pitch => &self.scripts.pitches,
            TurnCategory::ObjectionHandling => &self.scripts.objections,
            TurnCategory::Closing => &self.scripts.closings,
            TurnCategory::Goodbye => &self.scripts.goodbyes,
            TurnCategory::Clarification | TurnCategory::Faq => &self.scripts.clarifications,
        };
        let template = if templates.is_empty() {
            ""
        } else {
            let idx = self.rng.gen_range(0..templates.len());
            templates[idx].as_str()
        };
        let text = script::render(template, &self.ctx.slots);
        self.record(Speaker::Agent, &text, None);
        SpokenTurn { text, category }
    }

    fn record(&mut self, speaker: Speaker, text: &str, emotion: Option<EmotionSignal>) {
        self.ctx.history.push(Turn {
            speaker,
            text: text.to_string(),
            at: Utc::now(),
            emotion,
        });
    }

    fn decide(
        &self,
        state: ConversationState,
        turn: Option<SpokenTurn>,
        end_call: bool,
    ) -> Decision {
        Decision {
            state,
            turn,
            end_call,
        }
    }
}

fn is_refusal(language: &str, text: &str) -> bool {
    let lower = text.to_lowercase();
    let table = match language {
        "en" => REFUSALS_EN,
        _ => REFUSALS_DE,
    };
    table.iter().any(|p| lower.contains(p))
}

fn is_affirmative(language: &str, text: &str) -> bool {
    let lower = text.to_lowercase();
    let table = match language {
        "en" => AFFIRMATIVES_EN,
        _ => AFFIRMATIVES_DE,
    };
    table
        .iter()
        .any(|p| lower.split_whitespace().any(|w| w == *p) || lower == *p)
}

fn looks_like_question(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.ends_with('?')
        || ["was ", "wie ", "wann ", "warum ", "what ", "how ", "when "]
            .iter()
            .any(|p| lower.starts_with(p))
}
