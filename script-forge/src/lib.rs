//! script-forge library crate.
//!
//! Multi-step generation pipelines for short-form video scripts, driven
//! through an asynchronous job-queue backend.

pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod utils;

pub use error::{Error, Result};
