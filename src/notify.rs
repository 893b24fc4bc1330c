//! De-duplicated status reporting.
//!
//! Long steady-state stretches would otherwise flood the log with identical
//! lines every polling cycle; the notifier caches the most recent message and
//! suppresses exact repeats. A changed message always goes out immediately,
//! so transitions back to normal are still reported.

use log::{debug, info};

#[derive(Debug, Default)]
pub struct Notifier {
    last_message: Option<String>,
    last_was_steady: bool,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a state-transition or error line unless it repeats the previous
    /// one verbatim. Returns whether a line was written.
    pub fn announce(&mut self, message: &str) -> bool {
        if self.last_message.as_deref() == Some(message) {
            return false;
        }
        info!("{}", message);
        self.last_message = Some(message.to_string());
        self.last_was_steady = false;
        true
    }

    /// Emit a steady-state "no change" line. The first such line after a
    /// transition is logged at info; follow-ups that still describe a steady
    /// state (but differ, e.g. a device count change) drop to debug.
    pub fn steady(&mut self, message: &str) -> bool {
        if self.last_message.as_deref() == Some(message) {
            return false;
        }
        if self.last_was_steady {
            debug!("{}", message);
        } else {
            info!("{}", message);
        }
        self.last_message = Some(message.to_string());
        self.last_was_steady = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_message_is_suppressed() {
        let mut n = Notifier::new();
        assert!(n.announce("one"));
        assert!(!n.announce("one"));
        assert!(!n.announce("one"));
    }

    #[test]
    fn alternating_messages_all_emit() {
        let mut n = Notifier::new();
        assert!(n.announce("a"));
        assert!(n.announce("b"));
        assert!(n.announce("a"));
    }

    #[test]
    fn steady_lines_dedup_like_announcements() {
        let mut n = Notifier::new();
        assert!(n.steady("no change"));
        assert!(!n.steady("no change"));
        assert!(n.announce("mode changed"));
        assert!(n.steady("no change"));
    }
}
