pub mod api;
pub mod clients;
pub mod config;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod utils;
pub mod webhooks;
