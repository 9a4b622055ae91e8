//! Call-related types
//!
//! This module contains the types describing an intercepted method call:
//! the method identity used to locate targets, and the per-call context
//! handed to wrapper stages.

mod target;
mod types;

pub use target::{MethodName, MethodSig, TargetDescriptor, TypeSig};
pub use types::{Args, CallContext, Flow, Value};
