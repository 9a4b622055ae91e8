//! patchwork-rs - A framework for runtime method patching
//!
//! This framework lets independently written patch units modify methods of
//! a closed host application: wrapping them with pre- and post-stages,
//! rewriting their instruction bodies, and managing the native codec
//! plugins such patches load into the host's audio engine.
//!
//! # Getting Started
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use patchwork_rs::{CallContext, Flow, MethodSig, MethodTable, PatchUnit, TargetDescriptor, Value};
//!
//! #[patchwork_rs::pre_stage]
//! fn double_scroll(ctx: &mut CallContext) -> Flow {
//!     let delta = ctx.args.get(0).and_then(Value::as_int).unwrap_or_default();
//!     Flow::Modify([delta * 2].into_iter().collect())
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The host runtime exposes the methods units may patch
//!     let host = Arc::new(MethodTable::new());
//!     let scroll = host.define(MethodSig::new("Ui", "Scroll", ["int"]), |ctx| {
//!         ctx.result = ctx.args.get(0).cloned();
//!     });
//!
//!     let mut patcher = patchwork_rs::new()
//!         .init_logging(false)
//!         .host(Arc::clone(&host))
//!         .unit(
//!             PatchUnit::builder("scroll", TargetDescriptor::method("Ui", "Scroll"))
//!                 .pre(DoubleScroll)
//!                 .build(),
//!         )
//!         .build()?;
//!
//!     patcher.enable();
//!     let ctx = host.invoke(&scroll, None, [3i64].into_iter().collect()).unwrap();
//!     assert_eq!(ctx.result, Some(Value::Int(6)));
//!
//!     // Native resources are released and patches removed
//!     patcher.disable();
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod core;
pub mod ffi;
pub mod host;
pub mod patch;
pub mod patcher;
pub mod util;

pub use patchwork_macros::{post_stage, pre_stage};

pub use crate::call::{Args, CallContext, Flow, MethodName, MethodSig, TargetDescriptor, TypeSig, Value};
pub use crate::core::engine::{InstallReport, InstalledPatch, InterceptionEngine};
pub use crate::core::registry::{CallbackInit, NativeHandleEntry, NativeHandleRegistry, PluginAttach};
pub use crate::core::rewrite::{CallRedirect, Instruction, OpCode, Operand, Rewrite, Rewriter};
pub use crate::ffi::{PluginId, PluginLoader, ResultCode, SystemHandle};
pub use crate::host::{HostRuntime, InstallToken, MethodHandle, MethodTable};
pub use crate::patch::{Initializer, PatchUnit, PatchUnitBuilder};
pub use crate::patcher::{
	AlwaysApply, Applicability, LifecycleState, NeverApply, PatchError, Patcher, PatcherBuilder, PatcherConfig,
	PostStage, PreStage, Prepare,
};

/// Create a new patcher builder
#[must_use]
pub fn new() -> PatcherBuilder {
	PatcherBuilder::new()
}
