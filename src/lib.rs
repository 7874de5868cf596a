pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod health_monitor;
pub mod job_scheduler;
pub mod models;
pub mod registry;
pub mod routes;
