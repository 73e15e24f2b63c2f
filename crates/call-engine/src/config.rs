//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::timing::TimingConfig;

/// Configuration for the call engine.
///
/// Dial-plan fields (`channel_tech`, `trunk`, `context`, `extension`)
/// shape the Originate request; the timeouts govern local supervision
/// of calls the switch has gone quiet on.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Channel technology for outbound legs, e.g. `SIP` or `PJSIP`.
    pub channel_tech: String,
    /// Trunk name the outbound channel dials through.
    pub trunk: String,
    /// Dialplan context the answered call is dropped into.
    pub context: String,
    /// Extension within that context.
    pub extension: String,
    /// Caller ID presented to the far end.
    pub caller_id: String,
    /// Switch-side answer timeout passed on the Originate request.
    pub originate_timeout: Duration,
    /// Give up on a pre-answer call after this much switch silence.
    pub stall_timeout: Duration,
    /// How long a terminal call stays registered to absorb trailing
    /// switch events before eviction.
    pub eviction_grace: Duration,
    /// Synthesis voice identifier handed to the synthesizer.
    pub voice: String,
    /// Minimum analyzer confidence before a negative emotion forces
    /// objection handling.
    pub emotion_threshold: f32,
    /// Campaign language (`de`, `en`); selects the refusal and
    /// affirmative phrase tables the conversation matches against.
    pub language: String,
    /// Agent persona presented in the scripts.
    pub agent_name: String,
    pub company: String,
    /// Human-timing gate parameters.
    pub timing: TimingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_tech: "SIP".to_string(),
            trunk: "trunk".to_string(),
            context: "outbound".to_string(),
            extension: "s".to_string(),
            caller_id: "ringflow <100>".to_string(),
            originate_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(45),
            eviction_grace: Duration::from_secs(5),
            voice: "de-DE-standard".to_string(),
            emotion_threshold: 0.6,
            language: "de".to_string(),
            agent_name: "Anna".to_string(),
            company: "Ringflow GmbH".to_string(),
            timing: TimingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// The channel string the switch dials, e.g. `SIP/trunk/+4912345`.
    pub fn channel_for(&self, number: &str) -> String {
        format!("{}/{}/{}", self.channel_tech, self.trunk, number)
    }

    /// Slot values every conversation starts with.
    pub fn base_slots(&self) -> HashMap<String, String> {
        let mut slots = HashMap::new();
        slots.insert("agent_name".to_string(), self.agent_name.clone());
        slots.insert("company".to_string(), self.company.clone());
        slots
    }
}

/// Per-call parameters supplied by the caller of `dial`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialRequest {
    /// Destination number.
    pub number: String,
    /// Customer name for the scripts, when known.
    pub customer_name: Option<String>,
    /// Extra slot values merged over the engine defaults.
    #[serde(default)]
    pub slots: HashMap<String, String>,
}

impl DialRequest {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            ..Self::default()
        }
    }

    pub fn with_customer_name(mut self, name: impl Into<String>) -> Self {
        self.customer_name = Some(name.into());
        self
    }
}
