//! Storage module for netpulse.
//!
//! Measurements are kept in a flat, append-only CSV file.

mod csv_log;
mod models;

pub use csv_log::*;
pub use models::*;
