//! Status publication.
//!
//! The relay periodically publishes a short status string such as
//! `loadrelay(12c)` for whatever displays process status.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::proxy::Server;

/// Receiver of status strings.
pub trait StatusSink: Send + Sync {
    fn publish(&self, status: &str);
}

/// Holds the most recently published status.
#[derive(Debug)]
pub struct StatusBoard {
    current: ArcSwap<String>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(String::new()),
        }
    }

    /// Latest published status; empty before the first publication.
    pub fn current(&self) -> Arc<String> {
        self.current.load_full()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for StatusBoard {
    fn publish(&self, status: &str) {
        if self.current.load().as_str() == status {
            return;
        }
        self.current.store(Arc::new(status.to_string()));
        debug!(status, "Status updated");
    }
}

/// Publish `server`'s status line to `sink` every `interval`, forever.
pub async fn publish_status(server: &Server, sink: &dyn StatusSink, interval: Duration) -> Infallible {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        sink.publish(&server.status_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl StatusSink for Recorder {
        fn publish(&self, status: &str) {
            self.0.lock().unwrap().push(status.to_string());
        }
    }

    #[test]
    fn test_status_board_keeps_latest() {
        let board = StatusBoard::new();
        assert_eq!(board.current().as_str(), "");

        board.publish("relay(0c)");
        board.publish("relay(3c)");
        assert_eq!(board.current().as_str(), "relay(3c)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_status_ticks() {
        let server = Arc::new(Server::new("relay"));
        let recorder = Arc::new(Recorder::default());

        let task = {
            let server = Arc::clone(&server);
            let recorder = Arc::clone(&recorder);
            tokio::spawn(async move {
                publish_status(&server, recorder.as_ref(), Duration::from_millis(500)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        server.increment();
        tokio::time::sleep(Duration::from_millis(500)).await;

        task.abort();
        let published = recorder.0.lock().unwrap().clone();
        assert_eq!(published, vec!["relay(0c)".to_string(), "relay(1c)".to_string()]);
    }
}
