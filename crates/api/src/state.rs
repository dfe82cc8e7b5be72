//! Shared application state for the operator API.

use std::sync::Arc;

use tokio::sync::mpsc;

use herald_common::config::AppConfig;
use herald_notifier::intake::NotificationRequest;
use herald_notifier::store::NotificationStore;
use herald_scheduler::reminder::ReminderScheduler;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub notifications: Arc<dyn NotificationStore>,
    pub scheduler: Arc<ReminderScheduler>,
    /// Hands create/send-now requests to the running notification intake.
    pub intake: mpsc::Sender<NotificationRequest>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        notifications: Arc<dyn NotificationStore>,
        scheduler: Arc<ReminderScheduler>,
        intake: mpsc::Sender<NotificationRequest>,
    ) -> Self {
        Self {
            config,
            notifications,
            scheduler,
            intake,
        }
    }
}
