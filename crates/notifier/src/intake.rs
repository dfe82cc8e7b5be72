//! Notification intake.
//!
//! Other components hand work to the notifier over typed channels instead of
//! touching the record store directly: API requests arrive as
//! [`NotificationRequest`]s, fired reminder schedules arrive as [`DueSignal`]s.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DeliveryChannel, DueSignal, NewNotification, NotificationData};

use crate::dispatcher::{NotificationDispatcher, Outcome};
use crate::store::NotificationStore;

#[derive(Debug, Clone)]
pub enum NotificationRequest {
    /// Persist as `Pending`; the dispatcher picks it up when due.
    Create(NewNotification),
    /// Persist and deliver immediately.
    SendNow(NewNotification),
    /// A reminder schedule fired.
    Due(DueSignal),
}

/// Where reminders for each server are delivered.
#[derive(Debug, Clone, Default)]
pub struct ReminderRoutes {
    routes: HashMap<String, String>,
    default_recipient: Option<String>,
}

impl ReminderRoutes {
    pub fn new(routes: HashMap<String, String>, default_recipient: Option<String>) -> Self {
        Self {
            routes,
            default_recipient,
        }
    }

    pub fn recipient_for(&self, server_id: &str) -> Option<&str> {
        self.routes
            .get(server_id)
            .or(self.default_recipient.as_ref())
            .map(String::as_str)
    }
}

/// What the intake did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeResult {
    Queued(Uuid),
    Processed(Uuid, Outcome),
    /// A due signal for a server without a reminder route.
    Unrouted,
}

pub struct NotificationIntake {
    store: Arc<dyn NotificationStore>,
    dispatcher: Arc<NotificationDispatcher>,
    routes: ReminderRoutes,
}

impl NotificationIntake {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        dispatcher: Arc<NotificationDispatcher>,
        routes: ReminderRoutes,
    ) -> Self {
        Self {
            store,
            dispatcher,
            routes,
        }
    }

    pub async fn handle(&self, request: NotificationRequest) -> Result<IntakeResult, AppError> {
        match request {
            NotificationRequest::Create(new) => {
                let record = self.store.insert(new).await?;
                Ok(IntakeResult::Queued(record.id))
            }
            NotificationRequest::SendNow(new) => {
                let record = self.store.insert(new).await?;
                let outcome = self.dispatcher.process_notification(&record).await?;
                Ok(IntakeResult::Processed(record.id, outcome))
            }
            NotificationRequest::Due(signal) => match self.reminder_notification(&signal) {
                Some(new) => {
                    let record = self.store.insert(new).await?;
                    tracing::info!(
                        notification_id = %record.id,
                        task_id = %signal.task_id,
                        schedule_id = %signal.schedule_id,
                        "Reminder notification queued"
                    );
                    Ok(IntakeResult::Queued(record.id))
                }
                None => {
                    tracing::warn!(
                        task_id = %signal.task_id,
                        server_id = %signal.server_id,
                        "No reminder route for server, dropping due signal"
                    );
                    Ok(IntakeResult::Unrouted)
                }
            },
        }
    }

    /// The `task_reminder` notification for a fired schedule, if the server
    /// has somewhere to send it.
    pub fn reminder_notification(&self, signal: &DueSignal) -> Option<NewNotification> {
        let recipient = self.routes.recipient_for(&signal.server_id)?;

        Some(NewNotification {
            template: "task_reminder".to_string(),
            data: NotificationData::TaskReminder {
                task_id: signal.task_id.clone(),
                task_title: format!("#{}", signal.task_id),
                due_date: None,
                server_id: Some(signal.server_id.clone()),
            },
            channel: DeliveryChannel::Chat,
            recipient: recipient.to_string(),
            server_id: Some(signal.server_id.clone()),
            scheduled_for: signal.timestamp,
            is_recurring: false,
            recurrence_pattern: None,
            recurrence_end_date: None,
        })
    }

    /// Consume requests and due signals until both channels close or
    /// `shutdown` flips to `true`.
    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<NotificationRequest>,
        mut signals: mpsc::Receiver<DueSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("Notification intake started");

        let mut requests_open = true;
        let mut signals_open = true;

        while requests_open || signals_open {
            let request = tokio::select! {
                received = requests.recv(), if requests_open => match received {
                    Some(request) => request,
                    None => {
                        requests_open = false;
                        continue;
                    }
                },
                received = signals.recv(), if signals_open => match received {
                    Some(signal) => NotificationRequest::Due(signal),
                    None => {
                        signals_open = false;
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = self.handle(request).await {
                tracing::warn!(error = %e, "Failed to handle notification request");
            }
        }

        tracing::info!("Notification intake stopped");
    }
}
