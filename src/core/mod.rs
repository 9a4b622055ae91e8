//! Core functionality for patchwork
//!
//! This module contains the interception engine, the instruction
//! rewriter, and the native handle registry.

pub mod engine;
pub mod registry;
pub mod rewrite;
