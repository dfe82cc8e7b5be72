//! Periodic purge of old terminal notifications.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use herald_notifier::store::NotificationStore;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub async fn run(store: Arc<dyn NotificationStore>, retention_days: i64, mut shutdown: watch::Receiver<bool>) {
    if retention_days <= 0 {
        tracing::info!("Notification retention disabled");
        return;
    }

    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(retention_days, "Retention cleanup started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = Utc::now() - TimeDelta::days(retention_days);
                match store.cleanup_before(cutoff).await {
                    Ok(removed) => tracing::debug!(removed, cutoff = %cutoff, "Retention cleanup ran"),
                    Err(e) => tracing::warn!(error = %e, "Retention cleanup failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Retention cleanup stopped");
}
