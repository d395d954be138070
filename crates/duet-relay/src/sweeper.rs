//! Background purge of expired pairing requests and envelopes
//!
//! Every read path already treats expired records as absent; the sweeper
//! only reclaims memory.

use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

/// Spawn the periodic sweep task
pub fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_sweep(&state);
        }
    })
}

/// Run one sweep, returning (pairing requests, envelopes) removed
pub fn run_sweep(state: &AppState) -> (usize, usize) {
    let requests = state.registry.sweep();
    let envelopes = state.mailbox.sweep();
    if requests + envelopes > 0 {
        debug!(
            "Sweep removed {} pairing request(s) and {} envelope(s)",
            requests, envelopes
        );
    }
    (requests, envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::SignalRequest;
    use duet_auth::hash_token;
    use duet_core::RelayConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_sweep_keeps_live_records() {
        let state = AppState::from_config(RelayConfig::default()).await.unwrap();
        state
            .registry
            .initiate("c1", hash_token("secret"), None)
            .unwrap();
        state
            .mailbox
            .deposit(&SignalRequest::new("c1", "d1", "d2", json!({"n": 1})).unwrap())
            .unwrap();

        assert_eq!(run_sweep(&state), (0, 0));
        assert_eq!(state.registry.len(), 1);
        assert_eq!(state.mailbox.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_task_runs() {
        let config = RelayConfig::default()
            .with_signal_ttl_secs(1)
            .with_sweep_interval_secs(1);
        let state = Arc::new(AppState::from_config(config).await.unwrap());
        state
            .mailbox
            .deposit(&SignalRequest::new("c1", "d1", "d2", json!({"n": 1})).unwrap())
            .unwrap();

        let handle = spawn_sweeper(state.clone());
        time::sleep(Duration::from_millis(2500)).await;

        assert!(state.mailbox.is_empty());
        handle.abort();
    }
}
