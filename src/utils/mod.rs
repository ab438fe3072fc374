//! Utility functions shared by the collectors.
//!
//! - [`encoding`] - Fixed-point score codes and geometric growth

pub mod encoding;

pub use encoding::*;
