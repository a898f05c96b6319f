//! Shared types and utilities for Aperture
//!
//! This crate contains the data records exchanged between the sampling
//! producer, the aggregation engine and the tools that replay or export
//! profiles: raw tick samples, code registration events and exported
//! profile snapshots.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{events::*, profile::*};
