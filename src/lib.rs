pub mod analytics;
pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod migrations;
pub mod models;
pub mod notify;
pub mod rule_engine;
pub mod rules;
pub mod schedule;
pub mod store;
pub mod telemetry;
pub mod tsdb;
pub mod worker;
