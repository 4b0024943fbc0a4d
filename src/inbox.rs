use std::fmt;

use uuid::Uuid;

use crate::Subject;

/// Prefix shared by all one-time reply and data subjects.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Globally unique, single-use subject.
///
/// Inboxes carry request replies and the private data subject a discovery
/// listener hands to its notifier. They are opaque to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Inbox(String);

impl Inbox {
    /// Generate a new unique inbox subject.
    pub fn generate() -> Self {
        Self(format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple()))
    }

    /// Borrow the inbox as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into a bus subject.
    pub fn subject(&self) -> Subject {
        Subject::from(self.0.as_str())
    }
}

impl fmt::Display for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
