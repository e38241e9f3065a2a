use log::{info, warn};

/// Reopen bookkeeping for a device that can disappear (the modem serial port).
#[derive(Clone, Debug)]
pub struct ReconnectState {
    pub name: String,
    pub next_retry_at: f64,
    pub attempts: u32,
    pub base_cooldown: f64,
    pub current_cooldown: f64,
    pub max_cooldown: f64,
}

impl ReconnectState {
    pub fn new(name: &str, base_cooldown_secs: f64, max_cooldown_secs: f64) -> Self {
        ReconnectState {
            name: name.to_string(),
            next_retry_at: 0.0,
            attempts: 0,
            base_cooldown: base_cooldown_secs,
            current_cooldown: base_cooldown_secs,
            max_cooldown: max_cooldown_secs,
        }
    }

    /// Check if enough time has passed for retry
    pub fn can_retry(&self, now: f64) -> bool {
        now >= self.next_retry_at
    }

    /// Record a failed open and push the next retry out
    pub fn record_failed_attempt(&mut self, now: f64) {
        self.attempts += 1;

        // Exponential backoff: multiply cooldown by 1.5 each time, capped
        self.current_cooldown = (self.current_cooldown * 1.5).min(self.max_cooldown);
        self.next_retry_at = now + self.current_cooldown;

        warn!(
            "[MODEM] {} open attempt {} failed, next retry in {:.1}s",
            self.name, self.attempts, self.current_cooldown
        );
    }

    pub fn record_success(&mut self) {
        if self.attempts > 0 {
            info!(
                "[MODEM] {} reopened after {} attempt(s)",
                self.name, self.attempts
            );
        }
        self.attempts = 0;
        self.current_cooldown = self.base_cooldown;
        self.next_retry_at = 0.0;
    }

    pub fn status(&self, now: f64, connected: bool) -> String {
        if connected {
            return format!("{}: OK", self.name);
        }
        if !self.can_retry(now) {
            return format!(
                "{}: RECONNECT_PENDING (waiting {:.1}s, attempt {})",
                self.name,
                self.next_retry_at - now,
                self.attempts
            );
        }
        format!("{}: READY_TO_RECONNECT (attempt {})", self.name, self.attempts)
    }
}
