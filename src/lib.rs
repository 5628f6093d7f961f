//! Gauge discovery and reliability classification.
//!
//! Enumerates river gauges the upstream forecasting provider will answer for
//! but does not list, then classifies each one by how likely it is to be a
//! physical monitoring station rather than a hydrological model output.
//!
//! Module tree:
//! - `model`     : shared domain types (candidates, probe results, records).
//! - `config`    : `discovery.toml` loading and validation.
//! - `logging`   : tracing setup and structured log helpers.
//! - `ingest`    : the `LookupApi` seam and the live Flood Hub client.
//! - `dev_mode`  : replayed lookup API for offline runs and tests.
//! - `discovery` : candidate generation, rate limiting, probing, the store
//!   and the worker pool.
//! - `analysis`  : evidence, confidence scores and reliability tiers.
//! - `stations`  : reference stations used for external validation.
//! - `alert`     : threshold cache, severity checks and staleness.
//! - `report`    : run and registry reports.
//! - `db`        : PostgreSQL registry export.

pub mod alert;
pub mod analysis;
pub mod config;
pub mod db;
pub mod dev_mode;
pub mod discovery;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod report;
pub mod stations;
