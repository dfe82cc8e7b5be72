//! Operator HTTP API for the Herald bot.
//!
//! Served from inside the worker process so requests reach the same
//! dispatcher and scheduler instances that run the background loops.

pub mod middleware;
pub mod routes;
pub mod state;
