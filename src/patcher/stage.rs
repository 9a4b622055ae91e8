//! Wrapper stage traits and implementations
//!
//! This module contains the `PreStage` and `PostStage` traits and the
//! stock tracing stage used when call tracing is enabled.

use crate::call::{CallContext, Flow};
use tracing::debug;

/// Trait for logic run before a wrapped method's original body
pub trait PreStage: Send + Sync {
	/// Run before the original body
	///
	/// The stage may rewrite `ctx.args` in place, or return a [`Flow`] asking
	/// to replace the arguments or to skip the original body.
	fn before(&self, ctx: &mut CallContext) -> Flow;

	/// Get the name of the stage
	///
	/// This is used for debugging and logging purposes.
	fn name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}
}

/// Trait for logic run after a wrapped method's original body
///
/// Post-stages run whether or not the original body was skipped.
pub trait PostStage: Send + Sync {
	/// Run after the original body, or after a skipping pre-stage
	fn after(&self, ctx: &mut CallContext);

	/// Get the name of the stage
	///
	/// This is used for debugging and logging purposes.
	fn name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}
}

impl<F> PreStage for F
where
	F: Fn(&mut CallContext) -> Flow + Send + Sync,
{
	fn before(&self, ctx: &mut CallContext) -> Flow {
		self(ctx)
	}
}

impl<F> PostStage for F
where
	F: Fn(&mut CallContext) + Send + Sync,
{
	fn after(&self, ctx: &mut CallContext) {
		self(ctx);
	}
}

/// Stage that traces every wrapped call
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStage;

impl TracingStage {
	/// Create a new `TracingStage`
	#[must_use]
	pub const fn new() -> Self {
		Self
	}
}

impl PreStage for TracingStage {
	fn before(&self, ctx: &mut CallContext) -> Flow {
		debug!("Call: {}, instance: {:?}, args: {:?}", ctx.target, ctx.instance, ctx.args);
		Flow::Continue
	}

	fn name(&self) -> &'static str {
		"TracingStage"
	}
}

impl PostStage for TracingStage {
	fn after(&self, ctx: &mut CallContext) {
		debug!(
			"Return: {}, result: {:?}, skipped: {}",
			ctx.target, ctx.result, ctx.skipped
		);
	}

	fn name(&self) -> &'static str {
		"TracingStage"
	}
}
