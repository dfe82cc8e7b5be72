//! Notification delivery for the Herald bot.
//!
//! Records are persisted through a [`store::NotificationStore`], rendered with a
//! [`renderer::TemplateRenderer`], sent through the [`batcher::DispatchBatcher`]
//! to a [`provider::DeliveryProvider`], and moved through their lifecycle by the
//! [`dispatcher::NotificationDispatcher`].

pub mod backoff;
pub mod batcher;
pub mod discord;
pub mod dispatcher;
pub mod intake;
pub mod provider;
pub mod recurrence;
pub mod renderer;
pub mod store;

pub use dispatcher::{NotificationDispatcher, Outcome, TickSummary};
pub use intake::{NotificationIntake, NotificationRequest, ReminderRoutes};
pub use store::NotificationStore;
