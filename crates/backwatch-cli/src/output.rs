//! Console delivery sink
//!
//! Events go to stdout as JSON lines so they can be piped; connectivity
//! status goes to stderr. A terminal status additionally wakes the main
//! task so the process can exit instead of hanging on a dead stream.

use serde_json::Value;
use tokio::sync::mpsc;

use backwatch_core::stream::{SessionSink, StreamStatus};

pub struct ConsoleSink {
    terminated: mpsc::UnboundedSender<()>,
}

impl ConsoleSink {
    /// Returns the sink plus a receiver that fires once the session goes
    /// terminal
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (terminated, rx) = mpsc::unbounded_channel();
        (Self { terminated }, rx)
    }
}

impl SessionSink for ConsoleSink {
    fn on_event(&self, payload: &Value) -> anyhow::Result<()> {
        println!("{}", payload);
        Ok(())
    }

    fn on_status(&self, status: &StreamStatus) {
        if status.terminal {
            let budget = if status.max_attempts == 0 {
                "+".to_string()
            } else {
                format!("/{}", status.max_attempts)
            };
            eprintln!(
                "stream terminated (attempts {}{})",
                status.attempt, budget
            );
            let _ = self.terminated.send(());
        } else if status.connected {
            eprintln!("listening");
        } else if status.attempt > 0 {
            let budget = if status.max_attempts == 0 {
                "+".to_string()
            } else {
                format!("/{}", status.max_attempts)
            };
            eprintln!("reconnecting ({}{})...", status.attempt, budget);
        } else {
            eprintln!("disconnected");
        }
    }
}
