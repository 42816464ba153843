//! Lazygate - an API gateway that starts services on demand
//!
//! This library provides a path-routed gateway that:
//! - Routes `/{service}/...` requests to services listening on local ports
//! - Starts a service's processes the first time it is requested
//! - Stops services that have been idle longer than their timeout
//! - Probes running services' health endpoints on an interval
//! - Exposes management and statistics endpoints under `/api`
//! - Reloads its configuration when the config file changes

pub mod api;
pub mod config;
pub mod cors;
pub mod error;
pub mod gateway;
pub mod health;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod supervisor;
