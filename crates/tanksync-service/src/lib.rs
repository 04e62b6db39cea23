//! Sync daemon and HTTP REST API for aquarium telemetry.
//!
//! This crate provides a service that:
//! - Keeps a live subscription per configured sensor and backfills gaps
//! - Restores and periodically snapshots the reading cache
//! - Enforces retention by count, size and age
//! - Logs threshold alerts outside quiet hours
//! - Exposes a REST API for sync status and aggregated series
//!
//! The bundled backend is a simulated tank whose faults (lost readings,
//! dropped sessions, failing history pages) exercise the sync engine.
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health and sensors with incomplete data
//! - `GET /api/sensors` - Sync status of every sensor
//! - `GET /api/sensors/{id}` - Sync status of one sensor
//! - `GET /api/sensors/{id}/series` - Aggregated buckets (`409` while unsynced)
//! - `POST /api/sensors/{id}/retry` - Retry unresolved gaps
//! - `POST /api/sensors/{id}/resubscribe` - Reopen the live session
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/tanksync/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [storage]
//! max_readings = 500000
//! max_age_days = 30
//!
//! [alerts.limits.temperature]
//! min = 24.0
//! max = 27.0
//!
//! [alerts.limits.quiet_hours]
//! utc_offset_minutes = -300
//!
//! [[sensors]]
//! id = "tank-1/temperature"
//! alias = "Reef tank"
//! ```

pub mod alerts;
pub mod api;
pub mod config;
pub mod maintenance;
pub mod simulator;
pub mod state;

pub use alerts::{AlertLog, Notice};
pub use config::{
    AlertsConfig, Config, ConfigError, SensorConfig, ServerConfig, SimulationConfig,
    StorageConfig, ValidationError,
};
pub use maintenance::Maintenance;
pub use simulator::TankSimulator;
pub use state::AppState;
