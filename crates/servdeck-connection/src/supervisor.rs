//! Reconnection supervisor.
//!
//! One long-lived task per manager. It sleeps until the manager reports
//! `Disconnected`, then retries with exponential backoff plus jitter until
//! the manager is `Ready` again, the failure turns fatal, or the attempt
//! budget runs out. Attempts go through the manager's attempt lock, so they
//! never overlap with a registry-driven or manual attempt.

use std::sync::Weak;
use std::time::Duration;

use rand::Rng;
use servdeck_settings::ReconnectSettings;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use servdeck_core::ConnectionState;

use crate::manager::ConnectionManager;

/// Exponential backoff with symmetric jitter.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for BackoffPolicy {
    fn from(s: &ReconnectSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter_factor: s.jitter_factor.clamp(0.0, 1.0),
            max_attempts: s.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^attempt`, capped at `max_delay`, then `± jitter_factor`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);

        let spread = capped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

pub(crate) async fn run(
    manager: Weak<ConnectionManager>,
    mut state: watch::Receiver<ConnectionState>,
    policy: BackoffPolicy,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = state.wait_for(|s| *s == ConnectionState::Disconnected) => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let exhausted = retry_until_connected(&manager, &state, &policy, &cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        if exhausted {
            // Stay idle until someone else moves the manager out of Disconnected.
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = state.wait_for(|s| *s != ConnectionState::Disconnected) => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Returns true when the attempt budget ran out.
async fn retry_until_connected(
    manager: &Weak<ConnectionManager>,
    state: &watch::Receiver<ConnectionState>,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> bool {
    let mut attempt: u32 = 0;
    loop {
        if *state.borrow() != ConnectionState::Disconnected {
            return false;
        }
        if policy.exhausted(attempt) {
            if let Some(m) = manager.upgrade() {
                warn!(server_id = %m.server_id(), attempts = attempt, "reconnect attempts exhausted");
            }
            return true;
        }

        let delay = policy.delay(attempt);
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }

        let Some(m) = manager.upgrade() else {
            return false;
        };
        attempt += 1;
        metrics::counter!("servdeck_reconnect_attempts_total", "server_id" => m.server_id().to_string())
            .increment(1);
        info!(server_id = %m.server_id(), attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

        match m.attempt().await {
            Ok(()) => return false,
            Err(e) if e.is_fatal() => {
                warn!(server_id = %m.server_id(), error = %e, "reconnect stopped");
                return false;
            }
            Err(e) => {
                warn!(server_id = %m.server_id(), attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
}
