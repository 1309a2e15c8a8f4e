//! Linkwatch agent
//!
//! Probes host reachability and link throughput on independent cadences,
//! persists every result to a time-series store and keeps that store
//! reachable across restarts, outages and transient errors.

pub mod analysis;
pub mod config;
pub mod network_monitor;
pub mod output;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod supervisor;
pub mod testing;
pub mod trigger;

pub use config::Config;
pub use service::Monitor;
