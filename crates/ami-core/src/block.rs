//! Block data model
//!
//! A [`Block`] is one AMI protocol unit: an ordered sequence of
//! key/value pairs. Order matters on the wire (Asterisk renders some
//! multi-line payloads as repeated keys), so the model is a `Vec` of
//! pairs rather than a map, with case-insensitive lookup on top.

use std::fmt;

/// One decoded protocol block: ordered key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    fields: Vec<(String, String)>,
}

impl Block {
    /// Create an empty block.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Append a key/value pair, preserving insertion order.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    /// Look up the first value for `key`, case-insensitively.
    ///
    /// AMI is inconsistent about header casing (`ActionID` vs
    /// `ActionId`), so lookups never assume an exact case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in order of appearance.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The ordered fields of this block.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Number of key/value pairs.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the block carries no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The `ActionID` correlation value, if present.
    pub fn action_id(&self) -> Option<&str> {
        self.get("ActionID")
    }

    /// The `Event` name, if this block is an unsolicited event.
    pub fn event_name(&self) -> Option<&str> {
        self.get("Event")
    }

    /// The `Response` status (`Success`, `Error`, ...), if this block
    /// answers an action.
    pub fn response_status(&self) -> Option<&str> {
        self.get("Response")
    }

    /// Whether this block is a successful action response.
    pub fn is_success(&self) -> bool {
        self.response_status()
            .map(|s| s.eq_ignore_ascii_case("Success"))
            .unwrap_or(false)
    }
}

impl FromIterator<(String, String)> for Block {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.fields {
            writeln!(f, "{}: {}", k, v)?;
        }
        Ok(())
    }
}

/// Builder for an outbound action block.
///
/// The `Action` key goes first on the wire; the client stamps the
/// `ActionID` at submit time, so callers never set it themselves.
///
/// ```
/// use ringflow_ami_core::Action;
///
/// let action = Action::new("Originate")
///     .field("Channel", "SIP/trunk/+491234567")
///     .field("Context", "outbound")
///     .field("Async", "true");
/// assert_eq!(action.name(), "Originate");
/// ```
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    fields: Vec<(String, String)>,
}

impl Action {
    /// Start building an action with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a parameter field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// The action name (`Originate`, `Hangup`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render to a wire block, stamping the given correlation id.
    pub fn into_block(self, action_id: &str) -> Block {
        let mut block = Block::new();
        block.push("Action", self.name);
        block.push("ActionID", action_id);
        for (k, v) in self.fields {
            block.push(k, v);
        }
        block
    }
}
