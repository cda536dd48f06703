//! Connection states, the transition table and retry backoff.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::SessionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Idle, no session.
    Disconnected,
    /// Discovery in progress.
    Searching,
    /// A candidate device is being connected, bounded by a timeout.
    Connecting,
    /// Usable session.
    Connected,
    /// Last attempt failed; eligible for retry.
    Error,
}

impl ConnectionState {
    /// Map a raw state code from the protocol session (0..=4).
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Searching),
            2 => Some(Self::Connecting),
            3 => Some(Self::Connected),
            4 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Disconnected => 0,
            Self::Searching => 1,
            Self::Connecting => 2,
            Self::Connected => 3,
            Self::Error => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Searching => "searching",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Whether the table allows moving from `self` to `to`.
    ///
    /// Staying in the same state is not a transition and returns `false`;
    /// callers treat it as a no-op before consulting the table.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Searching)
                | (Disconnected, Error)
                | (Searching, Connecting)
                | (Searching, Disconnected)
                | (Searching, Error)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Error)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Error, Searching)
                | (Error, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry and timeout configuration for one device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retry_count: u32,
    pub connection_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retry_count: 10,
            connection_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&SessionSettings> for RetryPolicy {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_retry_delay_ms),
            max_delay: Duration::from_millis(settings.max_retry_delay_ms),
            max_retry_count: settings.max_retry_count,
            connection_timeout: Duration::from_millis(settings.connection_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// `min(initial_delay * 2^retry_count, max_delay)`, saturating.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}
