//! Reminder schedule routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::{Frequency, ReminderSchedule};

use crate::middleware::auth::AuthOperator;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/reminders", post(schedule_reminder))
        .route(
            "/api/reminders/{task_id}",
            get(list_reminders).delete(cancel_reminders),
        )
}

#[derive(Debug, Deserialize)]
pub struct ScheduleReminderRequest {
    pub task_id: String,
    pub server_id: String,
    pub scheduled_for: DateTime<Utc>,
    #[serde(default)]
    pub frequency: Option<Frequency>,
}

/// POST /api/reminders — Schedule a reminder for a task.
async fn schedule_reminder(
    State(state): State<AppState>,
    _auth: AuthOperator,
    Json(req): Json<ScheduleReminderRequest>,
) -> Result<(StatusCode, Json<ReminderSchedule>), AppError> {
    let schedule = state
        .scheduler
        .schedule_reminder(
            &req.task_id,
            &req.server_id,
            req.scheduled_for,
            req.frequency.unwrap_or(Frequency::Once),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /api/reminders/:task_id — List a task's reminder schedules.
async fn list_reminders(
    State(state): State<AppState>,
    _auth: AuthOperator,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<ReminderSchedule>>, AppError> {
    let schedules = state.scheduler.list_reminders(&task_id).await?;
    Ok(Json(schedules))
}

/// DELETE /api/reminders/:task_id — Cancel every reminder for a task.
async fn cancel_reminders(
    State(state): State<AppState>,
    _auth: AuthOperator,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let cancelled = state.scheduler.cancel_reminder(&task_id).await?;
    Ok(Json(serde_json::json!({ "task_id": task_id, "cancelled": cancelled })))
}
