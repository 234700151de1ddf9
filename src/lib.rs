//! Tierwarden - A supervisor for a reverse proxy and its application backend
//!
//! This library keeps a two-tier local web service alive:
//! - Starts the proxy and backend in order, rolling back on any failure
//! - Waits for ports to free up before binding them
//! - Checks both processes periodically and restarts a dead backend
//! - Recycles the backend on a schedule to bound its request count
//! - Publishes status snapshots and a tagged log/event stream

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod health;
pub mod ports;
pub mod process;
pub mod proxy_conf;
pub mod registry;
pub mod scheduler;
pub mod supervisor;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
