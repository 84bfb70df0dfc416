//! Process-wide session accounting.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Aggregate load across every listener context of this process.
///
/// Only [`ListenerContext`](super::ListenerContext) mutates the counter, and
/// only while holding its own target lock, so the value equals the sum of
/// every backend target's load whenever no selection or release is in flight.
#[derive(Debug)]
pub struct Server {
    role: String,
    load: AtomicUsize,
}

impl Server {
    /// Create the accounting record for a process running as `role`.
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            load: AtomicUsize::new(0),
        }
    }

    /// Number of sessions currently holding a backend slot.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Status string of the form `<role>(<N>c)`.
    pub fn status_line(&self) -> String {
        format!("{}({}c)", self.role, self.load())
    }

    pub(crate) fn increment(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement(&self) {
        self.load.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        let server = Server::new("relay");
        assert_eq!(server.status_line(), "relay(0c)");

        server.increment();
        server.increment();
        assert_eq!(server.load(), 2);
        assert_eq!(server.status_line(), "relay(2c)");

        server.decrement();
        assert_eq!(server.status_line(), "relay(1c)");
    }
}
