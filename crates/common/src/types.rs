use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::AppError;

/// Lifecycle status of a notification record.
///
/// `Pending` is initial. `Sent`, `PermanentlyFailed` and `Error` are terminal.
/// `Failed` stays retryable until the retry budget runs out. `Processing`
/// marks a record claimed by exactly one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    PermanentlyFailed,
    Error,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::PermanentlyFailed | NotificationStatus::Error
        )
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Processing => write!(f, "processing"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Failed => write!(f, "failed"),
            NotificationStatus::PermanentlyFailed => write!(f, "permanently_failed"),
            NotificationStatus::Error => write!(f, "error"),
        }
    }
}

/// Delivery channel a notification is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryChannel {
    /// Discord channel, addressed by webhook URL.
    Chat,
    Email,
    Sms,
    Webhook,
}

impl std::fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryChannel::Chat => write!(f, "chat"),
            DeliveryChannel::Email => write!(f, "email"),
            DeliveryChannel::Sms => write!(f, "sms"),
            DeliveryChannel::Webhook => write!(f, "webhook"),
        }
    }
}

/// Severity attached to system alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Template data for a notification, tagged by kind.
///
/// Serialized as a flat JSON object with a `kind` discriminator, which is also
/// the shape templates see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationData {
    TaskReminder {
        task_id: String,
        task_title: String,
        #[serde(default)]
        due_date: Option<DateTime<Utc>>,
        #[serde(default)]
        server_id: Option<String>,
    },
    TaskAssigned {
        task_id: String,
        task_title: String,
        assignee: String,
        #[serde(default)]
        assigned_by: Option<String>,
    },
    TaskUpdated {
        task_id: String,
        task_title: String,
        #[serde(default)]
        changes: Vec<String>,
    },
    SystemAlert {
        title: String,
        message: String,
        severity: Severity,
    },
    Custom {
        #[serde(default)]
        fields: serde_json::Map<String, serde_json::Value>,
    },
}

impl NotificationData {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationData::TaskReminder { .. } => "task_reminder",
            NotificationData::TaskAssigned { .. } => "task_assigned",
            NotificationData::TaskUpdated { .. } => "task_updated",
            NotificationData::SystemAlert { .. } => "system_alert",
            NotificationData::Custom { .. } => "custom",
        }
    }
}

/// What a delivery provider hands back on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Provider-side message id, when the provider reports one.
    pub message_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
    pub provider: String,
}

/// A persisted notification.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub template: String,
    pub data: Json<NotificationData>,
    pub channel: DeliveryChannel,
    pub recipient: String,
    pub server_id: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub status: NotificationStatus,
    pub retry_count: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivery_result: Option<Json<DeliveryReceipt>>,
    pub is_recurring: bool,
    pub recurrence_pattern: Option<String>,
    pub recurrence_end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Retry count as an unsigned attempt index.
    pub fn retries(&self) -> u32 {
        self.retry_count.max(0) as u32
    }

    /// Build a fresh `Pending` record from an insert request.
    pub fn from_new(new: NewNotification, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            template: new.template,
            data: Json(new.data),
            channel: new.channel,
            recipient: new.recipient,
            server_id: new.server_id,
            scheduled_for: new.scheduled_for,
            status: NotificationStatus::Pending,
            retry_count: 0,
            last_attempt: None,
            last_error: None,
            delivery_result: None,
            is_recurring: new.is_recurring,
            recurrence_pattern: new.recurrence_pattern,
            recurrence_end_date: new.recurrence_end_date,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Insert request for a notification. Status, retry count and timestamps are
/// owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub template: String,
    pub data: NotificationData,
    pub channel: DeliveryChannel,
    pub recipient: String,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurrence_pattern: Option<String>,
    #[serde(default)]
    pub recurrence_end_date: Option<DateTime<Utc>>,
}

impl NewNotification {
    /// Follow-up occurrence of a recurring notification.
    pub fn next_occurrence(record: &NotificationRecord, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            template: record.template.clone(),
            data: record.data.0.clone(),
            channel: record.channel,
            recipient: record.recipient.clone(),
            server_id: record.server_id.clone(),
            scheduled_for,
            is_recurring: true,
            recurrence_pattern: record.recurrence_pattern.clone(),
            recurrence_end_date: record.recurrence_end_date,
        }
    }
}

/// Query filter for notification lookups. Unset fields are unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub channel: Option<DeliveryChannel>,
    pub recipient: Option<String>,
    pub server_id: Option<String>,
    pub template: Option<String>,
    pub scheduled_from: Option<DateTime<Utc>>,
    pub scheduled_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl NotificationFilter {
    pub const DEFAULT_LIMIT: i64 = 100;

    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, 1000)
    }

    /// In-process evaluation of the filter, mirroring the SQL `WHERE` clause.
    pub fn matches(&self, record: &NotificationRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.channel.is_none_or(|c| record.channel == c)
            && self
                .recipient
                .as_ref()
                .is_none_or(|r| &record.recipient == r)
            && self
                .server_id
                .as_ref()
                .is_none_or(|s| record.server_id.as_ref() == Some(s))
            && self.template.as_ref().is_none_or(|t| &record.template == t)
            && self.scheduled_from.is_none_or(|from| record.scheduled_for >= from)
            && self.scheduled_to.is_none_or(|to| record.scheduled_for <= to)
    }
}

/// How often a reminder fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Once,
    Daily,
    Weekly,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Once => write!(f, "once"),
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
        }
    }
}

impl FromStr for Frequency {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Frequency::Once),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            other => Err(AppError::Validation(format!(
                "Invalid frequency '{}'. Valid values: once, daily, weekly",
                other
            ))),
        }
    }
}

/// A reminder schedule owned by the scheduler.
///
/// `frequency` is kept as raw text so a single bad row cannot break a whole
/// `find_due` query; it is parsed per entry when the schedule fires.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReminderSchedule {
    pub id: Uuid,
    pub task_id: String,
    pub server_id: String,
    pub frequency: String,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ReminderSchedule {
    pub fn frequency(&self) -> Result<Frequency, AppError> {
        self.frequency.parse()
    }
}

/// Insert request for a reminder schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReminder {
    pub task_id: String,
    pub server_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub frequency: Frequency,
}

/// Emitted by the scheduler when a reminder schedule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DueSignal {
    pub task_id: String,
    pub schedule_id: Uuid,
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
}
