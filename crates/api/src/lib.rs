//! HTTP API for the retrier: server wiring, routing, and request/response mapping.

pub mod actions;
pub mod app;
pub mod config;
