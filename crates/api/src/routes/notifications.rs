//! Notification lookup and submission routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{NewNotification, NotificationFilter, NotificationRecord};
use herald_notifier::intake::NotificationRequest;
use herald_notifier::recurrence::RecurrencePattern;

use crate::middleware::auth::AuthOperator;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/notifications",
            get(list_notifications).post(submit_notification),
        )
        .route("/api/notifications/{id}", get(get_notification))
}

#[derive(Debug, Deserialize)]
pub struct SubmitNotificationRequest {
    #[serde(flatten)]
    pub notification: NewNotification,
    /// Deliver immediately instead of waiting for the next dispatch tick.
    #[serde(default)]
    pub send_now: bool,
}

/// GET /api/notifications — Query notifications by filter.
async fn list_notifications(
    State(state): State<AppState>,
    _auth: AuthOperator,
    Query(filter): Query<NotificationFilter>,
) -> Result<Json<Vec<NotificationRecord>>, AppError> {
    let records = state.notifications.find_by_filters(&filter).await?;
    Ok(Json(records))
}

/// GET /api/notifications/:id — Fetch a single notification.
async fn get_notification(
    State(state): State<AppState>,
    _auth: AuthOperator,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationRecord>, AppError> {
    state
        .notifications
        .find_by_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
}

/// POST /api/notifications — Queue a notification, or send it right away.
async fn submit_notification(
    State(state): State<AppState>,
    auth: AuthOperator,
    Json(req): Json<SubmitNotificationRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    validate(&req.notification)?;

    let template = req.notification.template.clone();
    let request = if req.send_now {
        NotificationRequest::SendNow(req.notification)
    } else {
        NotificationRequest::Create(req.notification)
    };

    state
        .intake
        .send(request)
        .await
        .map_err(|_| AppError::Internal("Notification intake is not running".to_string()))?;

    tracing::info!(
        operator = %auth.subject,
        template = %template,
        send_now = req.send_now,
        "Notification submitted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true, "send_now": req.send_now })),
    ))
}

fn validate(new: &NewNotification) -> Result<(), AppError> {
    if new.template.trim().is_empty() {
        return Err(AppError::Validation("template must not be empty".to_string()));
    }
    if new.recipient.trim().is_empty() {
        return Err(AppError::Validation("recipient must not be empty".to_string()));
    }

    if new.is_recurring {
        let raw = new.recurrence_pattern.as_deref().ok_or_else(|| {
            AppError::Validation("recurring notifications need a recurrence_pattern".to_string())
        })?;
        raw.parse::<RecurrencePattern>()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        if new
            .recurrence_end_date
            .is_some_and(|end| end < new.scheduled_for)
        {
            return Err(AppError::Validation(
                "recurrence_end_date is before scheduled_for".to_string(),
            ));
        }
    }

    Ok(())
}
