use std::time::Duration;

use serde::Deserialize;

const fn default_tick_secs() -> u64 {
    10
}

const fn default_give_up_secs() -> u64 {
    60
}

const fn default_max_concurrent_send_jobs() -> usize {
    10
}

const fn default_max_session_uses() -> u32 {
    100
}

const fn default_send_receive_secs() -> u64 {
    2
}

const fn default_final_ok_secs() -> u64 {
    5
}

/// Per-command timeouts the outbound SMTP client collaborator enforces.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SmtpTimeouts {
    /// Budget for each SMTP command round-trip.
    #[serde(default = "default_send_receive_secs")]
    pub send_receive_secs: u64,

    /// Budget for the final `250 OK` after the message body.
    #[serde(default = "default_final_ok_secs")]
    pub final_ok_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            send_receive_secs: default_send_receive_secs(),
            final_ok_secs: default_final_ok_secs(),
        }
    }
}

/// Configuration for the delivery loop and client cache.
///
/// # Examples
///
/// RON config:
/// ```ron
/// Postrider (
///     delivery: (
///         max_concurrent_send_jobs: 32,
///         give_up_secs: 60,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// How often the loop rescans the active queue (in seconds).
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Hard deadline on waiting for a pooled connection plus the send
    /// itself (in seconds).
    #[serde(default = "default_give_up_secs")]
    pub give_up_secs: u64,

    /// Size bound of the client cache; the sole limiter on outbound I/O.
    #[serde(default = "default_max_concurrent_send_jobs")]
    pub max_concurrent_send_jobs: usize,

    /// Envelopes sent on one session before it is closed instead of
    /// returned to the pool.
    #[serde(default = "default_max_session_uses")]
    pub max_session_uses: u32,

    /// Timeouts handed to the SMTP client collaborator.
    #[serde(default)]
    pub smtp_timeouts: SmtpTimeouts,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            give_up_secs: default_give_up_secs(),
            max_concurrent_send_jobs: default_max_concurrent_send_jobs(),
            max_session_uses: default_max_session_uses(),
            smtp_timeouts: SmtpTimeouts::default(),
        }
    }
}

impl DeliveryConfig {
    pub const fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub const fn give_up(&self) -> Duration {
        Duration::from_secs(self.give_up_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_budgets() {
        let config = DeliveryConfig::default();
        assert_eq!(config.tick(), Duration::from_secs(10));
        assert_eq!(config.give_up(), Duration::from_secs(60));
        assert_eq!(config.max_concurrent_send_jobs, 10);
        assert_eq!(config.smtp_timeouts.send_receive_secs, 2);
        assert_eq!(config.smtp_timeouts.final_ok_secs, 5);
    }
}
