//! End-to-end tests for the IoT Core device client.
//!
//! This crate has no library code of its own; the scenarios live in `tests/`.
