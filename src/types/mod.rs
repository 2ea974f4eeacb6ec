//! Shared types for docbus

pub mod error;

pub use error::{BusError, Result, FAILURE_CODE};
