//! Script templates and FAQ lookup.
//!
//! Turns are rendered from templated scripts with `{slot}`
//! placeholders filled from the call's slot values. A missing slot is
//! a data-quality problem, not a call-ending one: the placeholder is
//! replaced with a safe default and logged as a warning.

use std::collections::HashMap;

use tracing::warn;

/// One FAQ entry: keyword patterns mapped to a templated answer.
#[derive(Debug, Clone)]
pub struct Faq {
    pub keywords: Vec<String>,
    pub answer: String,
}

/// The script tables for one campaign.
#[derive(Debug, Clone)]
pub struct ScriptLibrary {
    pub greetings: Vec<String>,
    pub qualifying: Vec<String>,
    pub pitches: Vec<String>,
    pub objections: Vec<String>,
    pub closings: Vec<String>,
    pub goodbyes: Vec<String>,
    pub clarifications: Vec<String>,
    pub faqs: Vec<Faq>,
}

impl Default for ScriptLibrary {
    /// The stock German outbound campaign scripts.
    fn default() -> Self {
        Self {
            greetings: vec![
                "Guten Tag! Mein Name ist {agent_name} von {company}. Spreche ich mit {customer_name}?".into(),
                "Hallo! Hier spricht {agent_name} von {company}. Ist das {customer_name}?".into(),
            ],
            qualifying: vec![
                "Ich rufe an, weil wir ein spannendes Angebot für Sie haben. Haben Sie kurz Zeit?".into(),
                "Der Grund meines Anrufs ist unser neues Produkt. Darf ich Ihnen kurz davon erzählen?".into(),
            ],
            pitches: vec![
                "Unser Produkt spart Ihnen Zeit und Kosten. Klingt das interessant für Sie?".into(),
                "Sie können damit Ihre Abläufe deutlich vereinfachen. Wäre das etwas für Sie?".into(),
            ],
            objections: vec![
                "Ich verstehe Ihre Bedenken vollkommen. Darf ich kurz erklären, was uns unterscheidet?".into(),
                "Das höre ich öfter, und genau deshalb lohnt sich ein zweiter Blick. Darf ich?".into(),
            ],
            closings: vec![
                "Sehr gerne. Würden Sie einen Termin für eine ausführliche Präsentation vereinbaren?".into(),
                "Das freut mich. Möchten Sie, dass wir Ihnen die Unterlagen zusenden?".into(),
            ],
            goodbyes: vec![
                "Vielen Dank für Ihre Zeit. Auf Wiedersehen!".into(),
                "Ich danke Ihnen für das Gespräch. Bis bald!".into(),
            ],
            clarifications: vec![
                "Entschuldigung, das habe ich nicht ganz verstanden. Können Sie das wiederholen?".into(),
                "Wie meinen Sie das genau?".into(),
            ],
            faqs: vec![
                Faq {
                    keywords: vec!["preis".into(), "kost".into(), "teuer".into()],
                    answer: "Der Preis beginnt bei {price} Euro pro Monat.".into(),
                },
                Faq {
                    keywords: vec!["vertrag".into(), "laufzeit".into()],
                    answer: "Die Vertragslaufzeit beträgt {contract_duration} Monate.".into(),
                },
                Faq {
                    keywords: vec!["kündigung".into(), "kündigen".into()],
                    answer: "Sie können jederzeit mit einer Frist von {notice_period} kündigen.".into(),
                },
                Faq {
                    keywords: vec!["lieferung".into(), "liefern".into()],
                    answer: "Die Lieferung erfolgt innerhalb von {delivery_time} Werktagen.".into(),
                },
            ],
        }
    }
}

impl ScriptLibrary {
    /// Find the FAQ answer whose keywords match the utterance.
    pub fn faq_answer(&self, utterance: &str) -> Option<&str> {
        let lower = utterance.to_lowercase();
        self.faqs
            .iter()
            .find(|faq| faq.keywords.iter().any(|kw| lower.contains(kw.as_str())))
            .map(|faq| faq.answer.as_str())
    }
}

/// Render `{slot}` placeholders from the slot map.
///
/// Missing slots substitute a safe default and log a data-quality
/// warning; rendering never fails.
pub fn render(template: &str, slots: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match slots.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        warn!("slot {:?} missing, substituting safe default", key);
                        out.push_str(safe_default(key));
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                // Unbalanced brace; emit literally.
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Fallback values that keep a rendered turn speakable.
fn safe_default(key: &str) -> &'static str {
    match key {
        "customer_name" => "Ihnen",
        "agent_name" => "unserem Team",
        "company" => "unserem Haus",
        _ => "auf Anfrage",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_fills_known_slots() {
        let s = slots(&[("agent_name", "Anna"), ("company", "ACME")]);
        let out = render("Hier ist {agent_name} von {company}.", &s);
        assert_eq!(out, "Hier ist Anna von ACME.");
    }

    #[test]
    fn missing_slot_uses_safe_default_not_error() {
        let out = render("Spreche ich mit {customer_name}?", &HashMap::new());
        assert_eq!(out, "Spreche ich mit Ihnen?");

        let out = render("Der Preis beginnt bei {price} Euro.", &HashMap::new());
        assert_eq!(out, "Der Preis beginnt bei auf Anfrage Euro.");
    }

    #[test]
    fn unbalanced_brace_renders_literally() {
        let out = render("seltsam {aber ok", &HashMap::new());
        assert_eq!(out, "seltsam {aber ok");
    }

    #[test]
    fn faq_matches_on_keywords() {
        let lib = ScriptLibrary::default();
        assert!(lib.faq_answer("Was kostet das denn?").unwrap().contains("{price}"));
        assert!(lib
            .faq_answer("Wie lange ist die Laufzeit?")
            .unwrap()
            .contains("{contract_duration}"));
        assert!(lib.faq_answer("Ich mag Hunde").is_none());
    }
}
