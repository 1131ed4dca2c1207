//! Common types shared across the slds crates.
//!
//! This crate provides:
//! - The unified error type with stable codes and categories
//! - The CLI output format enum

pub mod error;
pub mod output;

pub use error::{Error, ErrorCategory, Result};
pub use output::OutputFormat;
