//! De-duplicated warning log
//!
//! A migration run touches the same missing type or encoding fallback in
//! thousands of records. [`WarningLog`] emits each distinct message once
//! through `tracing` and keeps the list for the final report.

use indexmap::IndexSet;

/// Run-scoped set of warnings already emitted
#[derive(Debug, Default, Clone)]
pub struct WarningLog {
    seen: IndexSet<String>,
}

impl WarningLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `message` unless it was emitted before
    ///
    /// Returns whether the message was new.
    pub fn warn(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.seen.contains(&message) {
            return false;
        }
        tracing::warn!("{message}");
        self.seen.insert(message);
        true
    }

    /// Messages in first-seen order
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.seen.iter().map(String::as_str)
    }

    /// Number of distinct messages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing was logged
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_dropped() {
        let mut log = WarningLog::new();
        assert!(log.warn("Missing factory for module1 Factory"));
        assert!(!log.warn("Missing factory for module1 Factory"));
        assert!(log.warn("Missing factory for module1 Data"));
        assert_eq!(
            log.messages().collect::<Vec<_>>(),
            vec![
                "Missing factory for module1 Factory",
                "Missing factory for module1 Data"
            ]
        );
    }
}
