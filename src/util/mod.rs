//! Utility modules for patchwork
//!
//! This module contains utility functions and types used by patchwork.

pub mod logging;

pub use logging::init_logging;
