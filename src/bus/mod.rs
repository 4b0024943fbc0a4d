//! Bus implementations.
//!
//! This module provides concrete implementations of the domain-level `Bus`
//! and `WorkQueue` traits. The in-memory bus is always available; NATS is
//! behind the `transport_nats` feature and exposed only through its
//! constructor function.
//!
//! Domain code must not depend on bus-specific types.

mod guard;
mod memory;

#[cfg(feature = "transport_nats")]
mod nats;

pub use guard::BusGuard;
pub use memory::{create_memory_bus, create_memory_bus_with_hub, MemoryHub};

#[cfg(feature = "transport_nats")]
pub use nats::create_nats_bus;

#[cfg(not(feature = "transport_nats"))]
pub async fn create_nats_bus(_config: &crate::PipeConfig) -> crate::Result<crate::BusPtr> {
    Err(crate::PipeError::Connect(
        "transport_nats feature is not enabled".into(),
    ))
}

/// Token-wise subject match. `*` matches exactly one token, a trailing `>`
/// matches one or more.
pub(crate) fn subject_matches(pattern: &str, subject: &str) -> bool {
    // ---
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');

    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::subject_matches;

    #[test]
    fn test_literal_match() {
        assert!(subject_matches("pipe.x", "pipe.x"));
        assert!(!subject_matches("pipe.x", "pipe.y"));
        assert!(!subject_matches("pipe.x", "pipe.x.discover"));
        assert!(!subject_matches("pipe.x.discover", "pipe.x"));
    }

    #[test]
    fn test_wildcards() {
        // ---
        assert!(subject_matches("pipe.ASYNC.>", "pipe.ASYNC.jobs"));
        assert!(subject_matches("pipe.ASYNC.>", "pipe.ASYNC.a.b"));
        assert!(!subject_matches("pipe.ASYNC.>", "pipe.ASYNC"));
        assert!(!subject_matches("pipe.ASYNC.>", "pipe.jobs"));

        assert!(subject_matches("pipe.*.discover", "pipe.x.discover"));
        assert!(!subject_matches("pipe.*", "pipe.x.discover"));
    }
}
