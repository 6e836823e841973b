//! Execution context for a build
//!
//! Contains the state shared while a build stage runs:
//! - Log buffer for collecting run logs
//! - Cancellation signal from the orchestrator

use shipyard_core::domain::log::{LogEntry, LogLevel};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

/// Execution context shared across a build
pub struct BuildContext {
    pub run_id: Uuid,

    /// Log buffer with entries
    log_buffer: Mutex<Vec<LogEntry>>,

    /// Flips to `true` when the run is cancelled
    cancel: watch::Receiver<bool>,
}

impl BuildContext {
    /// Creates a context that is never cancelled
    pub fn new(run_id: Uuid) -> Arc<Self> {
        let (_tx, rx) = watch::channel(false);
        Self::with_cancellation(run_id, rx)
    }

    /// Creates a context that observes a cancellation signal
    pub fn with_cancellation(run_id: Uuid, cancel: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            log_buffer: Mutex::new(Vec::new()),
            cancel,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the run is cancelled; never resolves otherwise
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without cancelling
                std::future::pending::<()>().await;
            }
        }
    }

    /// Adds a log entry to the buffer
    pub fn add_log(&self, entry: LogEntry) {
        let mut buffer = self.log_buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push(entry);
    }

    /// Logs an info message
    pub fn log_info(&self, message: impl Into<String>) {
        self.add_log(LogEntry::now(LogLevel::Info, message));
    }

    /// Logs a warning message
    pub fn log_warning(&self, message: impl Into<String>) {
        self.add_log(LogEntry::now(LogLevel::Warning, message));
    }

    /// Logs an error message
    pub fn log_error(&self, message: impl Into<String>) {
        self.add_log(LogEntry::now(LogLevel::Error, message));
    }

    /// Drains all log entries from the buffer
    pub fn drain_logs(&self) -> Vec<LogEntry> {
        let mut buffer = self.log_buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.drain(..).collect()
    }

    /// Gets a snapshot of current logs without draining
    pub fn peek_logs(&self) -> Vec<LogEntry> {
        self.log_buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_drain_logs() {
        let ctx = BuildContext::new(Uuid::new_v4());
        ctx.log_info("test1");
        ctx.log_error("test2");

        assert_eq!(ctx.peek_logs().len(), 2);
        let drained = ctx.drain_logs();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].level, LogLevel::Error);
        assert!(ctx.drain_logs().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_signal() {
        let (tx, rx) = watch::channel(false);
        let ctx = BuildContext::with_cancellation(Uuid::new_v4(), rx);
        assert!(!ctx.is_cancelled());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_uncancellable_context_never_resolves() {
        let ctx = BuildContext::new(Uuid::new_v4());
        let result = tokio::time::timeout(Duration::from_millis(20), ctx.cancelled()).await;
        assert!(result.is_err());
    }
}
