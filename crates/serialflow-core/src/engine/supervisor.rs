//! Reconnection
//!
//! When an I/O loop reports a dead link the engine parks both loops and hands
//! over to a single reconnect task. The task reopens the device with a
//! growing delay until it succeeds, the attempt budget runs out, or the
//! session is cancelled.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Shared;

/// Upper bound for a single reconnect delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Delay before reconnect attempt `attempt` (1-based)
///
/// Flat at `base` for the first ten attempts, then `base * (attempt / 10)`
/// with integer division, capped at [`MAX_RECONNECT_DELAY`].
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = if attempt > 10 { attempt / 10 } else { 1 };
    base.saturating_mul(factor).min(MAX_RECONNECT_DELAY)
}

pub(super) async fn run(shared: Arc<Shared>, token: CancellationToken) {
    shared.close_link();

    let settings = shared.config.settings();
    let base = settings.reconnect_interval();
    let max = settings.max_reconnect_attempts;
    let unlimited = settings.unlimited_reconnect();
    let path = shared.config.port().device_path.clone();

    let mut attempt = 0u32;
    while unlimited || attempt < max {
        attempt = attempt.saturating_add(1);
        let delay = backoff_delay(base, attempt);

        tokio::select! {
            _ = token.cancelled() => {
                shared.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            _ = sleep(delay) => {}
        }

        info!(path = %path, attempt, max, "reconnecting");
        match shared.open_link() {
            Ok(()) => {
                if shared.resume(&token) {
                    info!(path = %path, attempt, "reconnected");
                }
                return;
            }
            Err(e) => warn!(path = %path, attempt, error = %e, "reconnect attempt failed"),
        }
    }

    shared.give_up(attempt);
}
