//! Logging handle passed to loops and the framework.
//!
//! Nothing in the crate logs through a global. Each [`Loop`](crate::reactor::Loop)
//! holds an `Arc<dyn Logger>` taken from its config; the default forwards to
//! [`tracing`], so installing a subscriber at the program's entry point is enough
//! to see output.

/// Log levels for loop and channel events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger trait for network events
///
/// Library users can implement this trait to handle logging however they prefer.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards every message to the `tracing` macros under the `millrace` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "millrace", "{}", message),
            LogLevel::Info => tracing::info!(target: "millrace", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "millrace", "{}", message),
            LogLevel::Error => tracing::error!(target: "millrace", "{}", message),
        }
    }
}

/// Default no-op logger that discards all messages
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Collects messages so tests can assert on what the loop reported.
    #[derive(Default)]
    pub(crate) struct CaptureLogger {
        pub(crate) lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl Logger for CaptureLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_capture_logger() {
        let logger = CaptureLogger::default();
        logger.log(LogLevel::Warn, "queue full");
        let lines = logger.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], (LogLevel::Warn, "queue full".to_string()));
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Error);
        assert!(LogLevel::Warn > LogLevel::Info);
    }
}
