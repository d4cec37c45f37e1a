//! Connection status and reconnect counters.

use crate::types::{ConnectionChange, ConnectionStatus};

#[derive(Debug)]
pub(crate) struct ConnectionState {
    status: ConnectionStatus,
    /// Attempts in the current streak; reset on every successful connect.
    reconnect_attempt: u32,
    /// Attempts over the lifetime of this state (reported in stats).
    reconnect_count: u64,
}

impl ConnectionState {
    pub(crate) fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempt: 0,
            reconnect_count: 0,
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub(crate) fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub(crate) fn reconnect_count(&self) -> u64 {
        self.reconnect_count
    }

    /// Move to `status`. Returns whether anything changed. `Error` is never held.
    pub(crate) fn transition(&mut self, status: ConnectionStatus) -> bool {
        if status == ConnectionStatus::Error || status == self.status {
            return false;
        }
        self.status = status;
        if status == ConnectionStatus::Connected || status == ConnectionStatus::Disconnected {
            self.reconnect_attempt = 0;
        }
        true
    }

    /// Count one reconnection attempt and return its number in the current streak.
    pub(crate) fn record_reconnect_attempt(&mut self) -> u32 {
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        self.reconnect_count = self.reconnect_count.saturating_add(1);
        self.status = ConnectionStatus::Reconnecting;
        self.reconnect_attempt
    }

    /// Snapshot for listeners. With an error attached the reported status is `Error`.
    pub(crate) fn change(&self, error: Option<String>) -> ConnectionChange {
        ConnectionChange {
            status: if error.is_some() {
                ConnectionStatus::Error
            } else {
                self.status
            },
            error,
            reconnect_attempt: self.reconnect_attempt,
        }
    }
}
