//! Validation errors produced by the configuration store.

use std::cmp::Ordering;
use std::fmt;

/// A single schema validation error.
///
/// `key` names the offending configuration key, or is empty for errors
/// about the update document as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Renders `'key' message`, or just the message when there is no key.
    pub fn full_message(&self) -> String {
        if self.key.is_empty() {
            self.message.clone()
        } else {
            format!("'{}' {}", self.key, self.message)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_message())
    }
}

impl std::error::Error for ConfigError {}

// Ordered by full message so error lists can be sorted into a
// deterministic form before being asserted on or displayed.
impl Ord for ConfigError {
    fn cmp(&self, other: &Self) -> Ordering {
        self.full_message().cmp(&other.full_message())
    }
}

impl PartialOrd for ConfigError {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Joins a list of errors into a single `;`-separated line for logs and
/// error displays.
pub fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ConfigError::full_message)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_message_with_and_without_key() {
        let err = ConfigError::new("url", "is required");
        assert_eq!(err.full_message(), "'url' is required");

        let err = ConfigError::new("", "The JSON document must be an object");
        assert_eq!(err.full_message(), "The JSON document must be an object");
    }

    #[test]
    fn sorts_by_full_message() {
        let mut errors = vec![
            ConfigError::new("foo", "is required"),
            ConfigError::new("bar", "must be an integer"),
        ];
        errors.sort();
        assert_eq!(errors[0].key, "bar");
        assert_eq!(errors[1].key, "foo");
    }

    #[test]
    fn join_renders_semicolon_separated() {
        let errors = vec![
            ConfigError::new("a", "is required"),
            ConfigError::new("b", "must be a number"),
        ];
        assert_eq!(join_errors(&errors), "'a' is required; 'b' must be a number");
    }
}
