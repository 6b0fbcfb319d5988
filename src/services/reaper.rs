//! Inactivity reaper: periodic demotion of sessions with stale heartbeats.
//!
//! DESIGN
//! ======
//! A single background task wakes on a fixed interval, asks the store for
//! active sessions whose `last_seen` predates the staleness threshold, and
//! marks each inactive. The reaper only touches durable state: a session
//! can go stale while its connection is closed, and live connections keep
//! themselves fresh through heartbeat touches.
//!
//! Failures are contained per pass and per session: a listing error skips
//! the pass, a marking error skips that session. The next tick retries
//! whatever remains stale.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::state::AppState;

const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
const DEFAULT_SESSION_STALE_MINUTES: i64 = 30;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn reaper_interval() -> std::time::Duration {
    std::time::Duration::from_secs(env_parse("REAPER_INTERVAL_SECS", DEFAULT_REAPER_INTERVAL_SECS))
}

fn stale_threshold() -> time::Duration {
    time::Duration::minutes(env_parse("SESSION_STALE_MINUTES", DEFAULT_SESSION_STALE_MINUTES))
}

/// Start the reaper loop. Aborted by the caller at shutdown.
#[must_use]
pub fn spawn_reaper(state: AppState) -> JoinHandle<()> {
    let interval = reaper_interval();
    let threshold = stale_threshold();
    info!(interval_secs = interval.as_secs(), stale_minutes = threshold.whole_minutes(), "reaper: started");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            sweep(&state, threshold).await;
        }
    })
}

/// One reaper pass. Returns how many sessions were demoted.
pub async fn sweep(state: &AppState, older_than: time::Duration) -> usize {
    let stale = match state.store.stale_sessions(older_than).await {
        Ok(stale) => stale,
        Err(e) => {
            warn!(error = %e, "reaper: stale listing failed, skipping pass");
            return 0;
        }
    };

    let mut demoted = 0usize;
    for session in stale {
        match state.store.set_session_inactive(session.session_id).await {
            Ok(()) => {
                info!(
                    session_id = %session.session_id,
                    presentation_id = %session.presentation_id,
                    nickname = %session.nickname,
                    "reaper: demoted stale session"
                );
                demoted += 1;
            }
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "reaper: demotion failed");
            }
        }
    }
    demoted
}

#[cfg(test)]
#[path = "reaper_test.rs"]
mod tests;
