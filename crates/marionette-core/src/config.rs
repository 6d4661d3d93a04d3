//! Engine configuration.

use std::time::Duration;

use marionette_proto::MAX_CELL_LEN;

/// Tuning knobs shared by the machine, dialer, and acceptor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on a marshaled cell and on the connection's read buffer
    pub max_cell_len: usize,
    /// Pause between execute-loop retries when no transition is available
    pub transition_retry: Duration,
    /// Optional deadline applied to blocking reads
    pub read_deadline: Option<Duration>,
    /// Optional deadline applied to writes; expiry is reported as a
    /// zero-byte partial write and retried by senders
    pub write_deadline: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_cell_len: MAX_CELL_LEN,
            transition_retry: Duration::from_millis(100),
            read_deadline: None,
            write_deadline: None,
        }
    }
}
