//! Storefront event dispatcher
//!
//! Publishes storefront domain events to a durable topic exchange and runs
//! one consumer per event kind, routing each delivery to its typed handler.
//!
//! - [`messaging`]: envelope, topology, broker backends, connection, publisher
//! - [`dispatch`]: handler registry, retry policy, consumer orchestrator
//! - [`handlers`]: the concrete handlers and their store and mail seams
//! - [`supervisor`]: process lifecycle and the liveness endpoint

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod messaging;
pub mod supervisor;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
