//! Network health agent for live streaming workstations.
//!
//! Watches which ingest servers the local broadcasting application streams
//! to, probes each of them on its own task, and reports latency plus host
//! metadata to a central collector.

pub mod agent;
pub mod api;
pub mod collector;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod host;
pub mod models;
pub mod netspeed;
pub mod probe;
pub mod reporting;
pub mod resolver;
pub mod task;
pub mod updater;
pub mod utils;

pub use agent::{Agent, AgentExit};
pub use config::AgentConfig;
pub use models::{Endpoint, HostSnapshot, Measurement};
