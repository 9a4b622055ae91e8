//! Per-call stage pipeline
//!
//! This module contains the `Wrapper` struct, the object a host runtime
//! invokes in place of a wrapped method. It runs the pre-stage, the
//! original body (unless skipped) and the post-stage in that order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace};

use crate::call::{CallContext, Flow};
use crate::patcher::stage::{PostStage, PreStage, TracingStage};

/// Statistics about calls through one wrapper
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallStats {
	/// Total number of wrapped calls
	pub calls: u64,
	/// Calls where the original body was skipped
	pub skipped: u64,
	/// Stage invocations that panicked and were contained
	pub stage_panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
	calls: AtomicU64,
	skipped: AtomicU64,
	stage_panics: AtomicU64,
}

/// Stage pipeline installed on one method for one patch unit
pub struct Wrapper {
	unit: String,
	pre: Option<Arc<dyn PreStage>>,
	post: Option<Arc<dyn PostStage>>,
	trace: bool,
	counters: Counters,
}

impl std::fmt::Debug for Wrapper {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Wrapper")
			.field("unit", &self.unit)
			.field("pre", &self.pre.as_ref().map(|s| s.name()))
			.field("post", &self.post.as_ref().map(|s| s.name()))
			.field("trace", &self.trace)
			.field("stats", &self.stats())
			.finish()
	}
}

impl Wrapper {
	/// Create a new wrapper
	#[must_use]
	pub fn new(
		unit: impl Into<String>,
		pre: Option<Arc<dyn PreStage>>,
		post: Option<Arc<dyn PostStage>>,
		trace: bool,
	) -> Self {
		Self {
			unit: unit.into(),
			pre,
			post,
			trace,
			counters: Counters::default(),
		}
	}

	/// Name of the unit this wrapper belongs to
	#[must_use]
	pub fn unit(&self) -> &str {
		&self.unit
	}

	/// Process a call through the pipeline
	///
	/// `original` runs the wrapped method's body (or the next inner
	/// wrapper). A panicking stage is contained and logged: a panicking
	/// pre-stage counts as [`Flow::Continue`].
	pub fn call(&self, ctx: &mut CallContext, original: &mut dyn FnMut(&mut CallContext)) {
		self.counters.calls.fetch_add(1, Ordering::Relaxed);

		if self.trace {
			TracingStage.before(ctx);
		}

		let flow = match &self.pre {
			Some(pre) => match catch_unwind(AssertUnwindSafe(|| pre.before(ctx))) {
				Ok(flow) => flow,
				Err(_) => {
					self.counters.stage_panics.fetch_add(1, Ordering::Relaxed);
					error!("{}: pre-stage {} panicked, running original", self.unit, pre.name());
					Flow::Continue
				},
			},
			None => Flow::Continue,
		};

		match flow {
			Flow::Continue => original(ctx),
			Flow::Modify(args) => {
				trace!("{}: arguments replaced by pre-stage", self.unit);
				ctx.args = args;
				original(ctx);
			},
			Flow::Skip => ctx.skipped = true,
			Flow::Return(value) => {
				ctx.result = Some(value);
				ctx.skipped = true;
			},
		}

		if ctx.skipped {
			self.counters.skipped.fetch_add(1, Ordering::Relaxed);
			trace!("{}: original body of {} skipped", self.unit, ctx.target);
		}

		if let Some(post) = &self.post {
			if catch_unwind(AssertUnwindSafe(|| post.after(ctx))).is_err() {
				self.counters.stage_panics.fetch_add(1, Ordering::Relaxed);
				error!("{}: post-stage {} panicked", self.unit, post.name());
			}
		}

		if self.trace {
			TracingStage.after(ctx);
		}
	}

	/// Get a snapshot of the call statistics
	#[must_use]
	pub fn stats(&self) -> CallStats {
		CallStats {
			calls: self.counters.calls.load(Ordering::Relaxed),
			skipped: self.counters.skipped.load(Ordering::Relaxed),
			stage_panics: self.counters.stage_panics.load(Ordering::Relaxed),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::call::{Args, MethodSig, Value};

	fn ctx(args: &[i64]) -> CallContext {
		CallContext::new(
			Arc::new(MethodSig::new("Counter", "Add", ["int"])),
			Some(Value::Handle(0x10)),
			args.iter().copied().collect(),
		)
	}

	fn add_one(ctx: &mut CallContext) {
		let v = ctx.args.get(0).and_then(Value::as_int).unwrap_or_default();
		ctx.result = Some(Value::Int(v + 1));
	}

	#[test]
	fn runs_pre_original_post_in_order() {
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));
		let (pre_log, post_log, body_log) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));

		let wrapper = Wrapper::new(
			"order",
			Some(Arc::new(move |_: &mut CallContext| {
				pre_log.lock().unwrap().push("pre");
				Flow::Continue
			})),
			Some(Arc::new(move |_: &mut CallContext| post_log.lock().unwrap().push("post"))),
			false,
		);

		let mut c = ctx(&[1]);
		wrapper.call(&mut c, &mut |_| body_log.lock().unwrap().push("body"));
		assert_eq!(*order.lock().unwrap(), vec!["pre", "body", "post"]);
	}

	#[test]
	fn modify_replaces_arguments() {
		let wrapper = Wrapper::new(
			"modify",
			Some(Arc::new(|_: &mut CallContext| Flow::Modify([10i64].into_iter().collect()))),
			None,
			false,
		);
		let mut c = ctx(&[1]);
		wrapper.call(&mut c, &mut add_one);
		assert_eq!(c.result, Some(Value::Int(11)));
		assert!(!c.skipped);
	}

	#[test]
	fn skip_still_runs_post_stage() {
		let wrapper = Wrapper::new(
			"skip",
			Some(Arc::new(|_: &mut CallContext| Flow::Return(Value::Int(-1)))),
			Some(Arc::new(|ctx: &mut CallContext| {
				if ctx.skipped {
					ctx.result = Some(Value::Int(-2));
				}
			})),
			false,
		);
		let mut c = ctx(&[1]);
		let mut ran = false;
		wrapper.call(&mut c, &mut |_| ran = true);
		assert!(!ran);
		assert_eq!(c.result, Some(Value::Int(-2)));
		assert_eq!(wrapper.stats().skipped, 1);
	}

	fn panicking_pre(_: &mut CallContext) -> Flow {
		panic!("pre")
	}

	fn panicking_post(_: &mut CallContext) {
		panic!("post")
	}

	#[test]
	fn panicking_stages_are_contained() {
		let wrapper = Wrapper::new("panics", Some(Arc::new(panicking_pre)), Some(Arc::new(panicking_post)), false);
		let mut c = ctx(&[4]);
		wrapper.call(&mut c, &mut add_one);
		assert_eq!(c.result, Some(Value::Int(5)));
		assert_eq!(wrapper.stats(), CallStats {
			calls: 1,
			skipped: 0,
			stage_panics: 2,
		});
	}

	#[test]
	fn stage_can_edit_args_in_place() {
		let wrapper = Wrapper::new(
			"in-place",
			Some(Arc::new(|ctx: &mut CallContext| {
				let _ = ctx.args.set(0, Value::Int(100));
				Flow::Continue
			})),
			None,
			true,
		);
		let mut c = ctx(&[0]);
		wrapper.call(&mut c, &mut add_one);
		assert_eq!(c.result, Some(Value::Int(101)));
		assert_eq!(c.args, Args::new(vec![Value::Int(100)]));
	}
}
