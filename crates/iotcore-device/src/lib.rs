//! IoT Core device agent: library crate behind the `iotcore-device` binary.
//!
//! Exposes the config loader, API handlers and periodic tasks so
//! `iotcore-e2e-tests` can drive them against a mock transport.

pub mod api;
pub mod config;
pub mod ping;
pub mod shadow_sync;
