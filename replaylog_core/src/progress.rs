//! Progress reporting for long-running operations (index rebuilds)
//!
//! Reporting is observational only; nothing in the library looks at what a sink
//! does with the messages.

/// Receives leveled status messages
pub trait Progress: Send + Sync {
    fn info(&self, msg: &str);

    fn warn(&self, msg: &str);

    fn error(&self, msg: &str);

    /// Bytes processed so far out of `total`
    fn progress(&self, _done: u64, _total: u64) {}
}

/// Forwards everything to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }

    fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
    }

    fn error(&self, msg: &str) {
        log::error!("{}", msg);
    }

    fn progress(&self, done: u64, total: u64) {
        if total > 0 {
            log::debug!("{:.1}% ({}/{} bytes)", done as f64 * 100.0 / total as f64, done, total);
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn info(&self, _msg: &str) {}

    fn warn(&self, _msg: &str) {}

    fn error(&self, _msg: &str) {}
}
