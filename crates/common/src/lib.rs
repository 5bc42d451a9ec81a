//! Common utilities, types, and configurations shared across sluice crates.
//!
//! This crate contains the base building blocks for the engine, including:
//! - **Configuration**: Strongly typed application configuration (`config`).
//! - **Identity**: Request ids, session info and determinism levels (`models`).
//! - **Values**: Runtime column types, values and coercions (`types`).
//! - **Large objects**: LOB values and their side store (`lob`).
//! - **Telemetry**: `tracing` subscriber setup (`telemetry`).
//! - **Warnings**: Per-request warning collection (`warnings`).
pub mod config;
pub mod lob;
pub mod models;
pub mod telemetry;
pub mod types;
pub mod warnings;
