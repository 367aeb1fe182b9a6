pub mod agent;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod gate;
pub mod level;
pub mod metrics;
pub mod mqtt;
pub mod performance;
pub mod pointer;
pub mod prompts;
pub mod rbac;
pub mod telemetry;
pub mod transition_log;
