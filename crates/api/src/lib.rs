//! HTTP API: task delivery endpoints and the job control surface.

pub mod app;
pub mod middleware;
