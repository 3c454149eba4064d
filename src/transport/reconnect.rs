use std::time::Duration;

/// Close code the server uses when the session token is no longer accepted.
pub const AUTH_FAILURE_CLOSE_CODE: u16 = 1008;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    Reconnect,
    ReAuthenticate,
}

pub fn classify_close(close_code: Option<u16>) -> CloseDisposition {
    match close_code {
        Some(AUTH_FAILURE_CLOSE_CODE) => CloseDisposition::ReAuthenticate,
        _ => CloseDisposition::Reconnect,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}
