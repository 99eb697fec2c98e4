//! Core data model, configuration and persisted state for handoff.

pub mod config;
pub mod error;
pub mod model;
pub mod state;

pub use error::CoreError;
