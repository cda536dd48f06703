//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `eventfabric` application.
//!
//! This module centralizes reusable components, such as the error taxonomy
//! and the tracing setup, so every layer reports failures the same way.

pub mod error;
pub mod logging;
