//! Template rendering.
//!
//! Templates see the notification data serialized as JSON (the `kind` tag plus
//! the variant's fields). The Handlebars registry runs in strict mode so a
//! template referencing a field the data does not carry fails instead of
//! rendering a blank.

use async_trait::async_trait;
use handlebars::Handlebars;
use thiserror::Error;

use herald_common::types::NotificationData;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("Invalid template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("Failed to render template '{template}': {reason}")]
    Render { template: String, reason: String },
}

/// Maps a template id plus data to rendered text.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, template_id: &str, data: &NotificationData) -> Result<String, RenderError>;
}

/// Built-in templates shipped with the bot.
const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "task_reminder",
        "⏰ Reminder: **{{task_title}}** (task `{{task_id}}`){{#if due_date}} is due {{due_date}}{{/if}}.",
    ),
    (
        "task_assigned",
        "📋 **{{task_title}}** (task `{{task_id}}`) was assigned to {{assignee}}{{#if assigned_by}} by {{assigned_by}}{{/if}}.",
    ),
    (
        "task_updated",
        "✏️ **{{task_title}}** (task `{{task_id}}`) was updated{{#if changes}}: {{#each changes}}{{this}}{{#unless @last}}, {{/unless}}{{/each}}{{/if}}.",
    ),
    ("system_alert", "[{{severity}}] **{{title}}**\n{{message}}"),
];

pub struct HandlebarsRenderer {
    registry: Handlebars<'static>,
}

impl HandlebarsRenderer {
    /// Registry pre-loaded with the built-in templates.
    pub fn new() -> Result<Self, RenderError> {
        let mut renderer = Self::empty();
        for (name, source) in BUILTIN_TEMPLATES {
            renderer.register(name, source)?;
        }
        Ok(renderer)
    }

    /// Registry with no templates.
    pub fn empty() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // Output goes to chat, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    /// Register or replace a template.
    pub fn register(&mut self, name: &str, source: &str) -> Result<(), RenderError> {
        self.registry
            .register_template_string(name, source)
            .map_err(|e| RenderError::InvalidTemplate {
                template: name.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }
}

#[async_trait]
impl TemplateRenderer for HandlebarsRenderer {
    async fn render(&self, template_id: &str, data: &NotificationData) -> Result<String, RenderError> {
        if !self.registry.has_template(template_id) {
            return Err(RenderError::UnknownTemplate(template_id.to_string()));
        }

        self.registry
            .render(template_id, data)
            .map_err(|e| RenderError::Render {
                template: template_id.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::Severity;

    fn reminder() -> NotificationData {
        NotificationData::TaskReminder {
            task_id: "42".to_string(),
            task_title: "Ship release".to_string(),
            due_date: None,
            server_id: None,
        }
    }

    #[tokio::test]
    async fn test_renders_task_reminder() {
        let renderer = HandlebarsRenderer::new().unwrap();
        let text = renderer.render("task_reminder", &reminder()).await.unwrap();
        assert_eq!(text, "⏰ Reminder: **Ship release** (task `42`).");
    }

    #[tokio::test]
    async fn test_renders_task_updated_change_list() {
        let renderer = HandlebarsRenderer::new().unwrap();
        let data = NotificationData::TaskUpdated {
            task_id: "9".to_string(),
            task_title: "Fix login".to_string(),
            changes: vec!["status → done".to_string(), "priority → high".to_string()],
        };
        let text = renderer.render("task_updated", &data).await.unwrap();
        assert!(text.ends_with("updated: status → done, priority → high."));
    }

    #[tokio::test]
    async fn test_no_html_escaping() {
        let renderer = HandlebarsRenderer::new().unwrap();
        let data = NotificationData::SystemAlert {
            title: "Bot <maintenance>".to_string(),
            message: "Don't panic & wait".to_string(),
            severity: Severity::Warning,
        };
        let text = renderer.render("system_alert", &data).await.unwrap();
        assert_eq!(text, "[warning] **Bot <maintenance>**\nDon't panic & wait");
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let renderer = HandlebarsRenderer::new().unwrap();
        let err = renderer.render("does_not_exist", &reminder()).await.unwrap_err();
        assert!(matches!(err, RenderError::UnknownTemplate(name) if name == "does_not_exist"));
    }

    #[tokio::test]
    async fn test_missing_field_fails_in_strict_mode() {
        let renderer = HandlebarsRenderer::new().unwrap();
        // task_assigned needs `assignee`, which a reminder does not carry.
        let err = renderer.render("task_assigned", &reminder()).await.unwrap_err();
        assert!(matches!(err, RenderError::Render { .. }));
    }

    #[test]
    fn test_invalid_template_source_rejected() {
        let mut renderer = HandlebarsRenderer::empty();
        assert!(renderer.register("broken", "{{#if}}unclosed").is_err());
        assert!(!renderer.has_template("broken"));
    }
}
