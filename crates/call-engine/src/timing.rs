//! Human-timing gate.
//!
//! A machine that answers in two milliseconds gives itself away. The
//! gate computes a bounded pseudo-random pre-speech delay from the
//! utterance length and a thinking/typing-speed model, and optionally
//! roughs the turn up the way spoken language is rough: an occasional
//! hesitation (a stutter, a false start, a mid-sentence correction)
//! plus filler words at word boundaries. The wait is a per-call sleep
//! raced against that call's cancel signal; it never blocks the read
//! loop or any other call.

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::debug;

/// Delay model parameters.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Lower clamp for the computed delay.
    pub min_delay: Duration,
    /// Upper clamp for the computed delay.
    pub max_delay: Duration,
    /// Fixed thinking time added to every turn.
    pub base_delay: Duration,
    /// Simulated formulation speed in words per minute.
    pub words_per_minute: u32,
    /// Probability of inserting a filler at each word boundary,
    /// `0.0..=1.0`. Zero disables fillers.
    pub filler_frequency: f64,
    /// Probability that a turn picks up one hesitation pattern (a word
    /// repetition, a false start, or a self-correction), `0.0..=1.0`.
    pub hesitation_frequency: f64,
    /// Filler and hesitation language (`de`, `en`).
    pub language: String,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            base_delay: Duration::from_millis(300),
            words_per_minute: 160,
            filler_frequency: 0.15,
            hesitation_frequency: 0.1,
            language: "de".to_string(),
        }
    }
}

const FILLERS_DE: &[&str] = &["äh", "ähm", "also", "nun", "naja", "sozusagen"];
const FILLERS_EN: &[&str] = &["um", "uh", "well", "you know", "I mean"];

/// Sentence openers a speaker breaks off and restarts differently.
const FALSE_STARTS_DE: &[(&str, &str)] = &[
    ("Ich möchte", "Ich würde gerne"),
    ("Das ist", "Das wäre"),
    ("Wir haben", "Wir bieten"),
];
const FALSE_STARTS_EN: &[(&str, &str)] = &[
    ("I want", "I would like"),
    ("This is", "This would be"),
    ("We have", "We offer"),
];

const CORRECTIONS_DE: &[&str] = &["oder besser gesagt", "ich meine", "also genauer"];
const CORRECTIONS_EN: &[&str] = &["or rather", "I mean", "more specifically"];

/// Computes and applies pre-speech delays.
pub struct TimingGate {
    config: TimingConfig,
    rng: Mutex<SmallRng>,
}

impl TimingGate {
    pub fn new(config: TimingConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Delay for the given turn: base thinking time plus formulation
    /// time per word, ±20% jitter, clamped to the configured bounds.
    pub fn response_delay(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count() as f64;
        let formulation = words * 60.0 / self.config.words_per_minute as f64;
        let total = self.config.base_delay.as_secs_f64() + formulation;

        let jitter = self.rng.lock().gen_range(0.8..1.2);
        let jittered = Duration::from_secs_f64(total * jitter);

        jittered.clamp(self.config.min_delay, self.config.max_delay)
    }

    /// Make the turn sound spoken rather than read: at most one
    /// hesitation pattern, then filler tokens at word boundaries, each
    /// at its configured frequency.
    pub fn embellish(&self, text: &str) -> String {
        let mut rng = self.rng.lock();
        let text = hesitate(&self.config, &mut rng, text);
        insert_fillers(&self.config, &mut rng, &text)
    }

    /// Wait out the delay for this turn. Returns `false` if the call's
    /// cancel signal fired first (the turn must not be spoken).
    pub async fn wait(&self, text: &str, cancel: &mut watch::Receiver<bool>) -> bool {
        if *cancel.borrow() {
            return false;
        }
        let delay = self.response_delay(text);
        debug!("gating turn for {:.2}s", delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.changed() => false,
        }
    }
}

fn hesitate(config: &TimingConfig, rng: &mut SmallRng, text: &str) -> String {
    let frequency = config.hesitation_frequency.clamp(0.0, 1.0);
    if frequency <= 0.0 || !rng.gen_bool(frequency) {
        return text.to_string();
    }
    let (false_starts, corrections) = match config.language.as_str() {
        "en" => (FALSE_STARTS_EN, CORRECTIONS_EN),
        _ => (FALSE_STARTS_DE, CORRECTIONS_DE),
    };
    match rng.gen_range(0..3u8) {
        0 => repeat_word(rng, text),
        1 => false_start(false_starts, text),
        _ => self_correct(rng, corrections, text),
    }
}

/// Stutter the opening: say the first or second word twice.
fn repeat_word(rng: &mut SmallRng, text: &str) -> String {
    let mut words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < 2 {
        return text.to_string();
    }
    let at = rng.gen_range(0..2);
    words.insert(at, words[at]);
    words.join(" ")
}

/// Break off a known opener and restart with its variant.
fn false_start(pairs: &[(&str, &str)], text: &str) -> String {
    for (opener, restart) in pairs {
        if let Some(rest) = text.strip_prefix(opener) {
            return format!("{}... {}{}", opener, restart, rest);
        }
    }
    text.to_string()
}

/// Interrupt mid-sentence with a correction phrase.
fn self_correct(rng: &mut SmallRng, corrections: &[&str], text: &str) -> String {
    let mut words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < 3 {
        return text.to_string();
    }
    let phrase = format!("... {}", corrections[rng.gen_range(0..corrections.len())]);
    words.insert(words.len() / 2, phrase.as_str());
    words.join(" ")
}

fn insert_fillers(config: &TimingConfig, rng: &mut SmallRng, text: &str) -> String {
    let frequency = config.filler_frequency.clamp(0.0, 1.0);
    if frequency <= 0.0 {
        return text.to_string();
    }
    let fillers: &[&str] = match config.language.as_str() {
        "en" => FILLERS_EN,
        _ => FILLERS_DE,
    };

    let mut out = String::with_capacity(text.len() + 16);
    for (i, word) in text.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
            if rng.gen_bool(frequency) {
                let filler = fillers[rng.gen_range(0..fillers.len())];
                out.push_str(filler);
                out.push_str(", ");
            }
        }
        out.push_str(word);
    }
    out
}
