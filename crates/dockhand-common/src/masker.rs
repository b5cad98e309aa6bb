// A growable set of strings redacted from log output.
// Shared by all matrix points of a Run; steps add to it at runtime
// through the add-mask workflow command.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text for redacted values.
const MASK: &str = "***";

/// A cloneable handle to a shared, thread-safe set of masked values.
///
/// Longer values are replaced first so that a value that is a substring of
/// another never leaves a partial remainder behind.
#[derive(Debug, Clone, Default)]
pub struct Masks {
    values: Arc<RwLock<Vec<String>>>,
}

impl Masks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to redact. Empty and whitespace-only values are
    /// ignored; duplicates are kept out.
    pub fn add(&self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut values = self.values.write();
        if !values.iter().any(|existing| existing == trimmed) {
            values.push(trimmed.to_string());
            values.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Redact every registered value in `line`.
    pub fn apply(&self, line: &str) -> String {
        let values = self.values.read();
        if values.is_empty() {
            return line.to_string();
        }
        let mut redacted = line.to_string();
        for value in values.iter() {
            if redacted.contains(value.as_str()) {
                redacted = redacted.replace(value.as_str(), MASK);
            }
        }
        redacted
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}
