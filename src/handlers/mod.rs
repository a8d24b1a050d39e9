//! HTTP handlers for setting ingestion.

pub mod setting;
pub use setting::*;
