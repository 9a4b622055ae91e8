//! Patch units
//!
//! A [`PatchUnit`] is one self-contained modification of one host method:
//! a target selector plus any of a preparation check, a pre-stage, a
//! post-stage, a rewriter, and a one-time initializer run after install.
//! Units are registered explicitly with the [`PatcherBuilder`], in the
//! order they should be installed.
//!
//! [`PatcherBuilder`]: crate::PatcherBuilder

use std::sync::Arc;

use crate::call::TargetDescriptor;
use crate::core::rewrite::Rewriter;
use crate::patcher::{PostStage, PreStage, Prepare, Result};

/// Trait for one-time initialization run after a unit is installed
pub trait Initializer: Send + Sync {
	/// Run the initialization
	///
	/// Errors are logged by the patcher and do not affect other units.
	fn initialize(&self) -> Result<()>;

	/// Get the name of the initializer
	///
	/// This is used for debugging and logging purposes.
	fn name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}
}

impl<F> Initializer for F
where
	F: Fn() -> Result<()> + Send + Sync,
{
	fn initialize(&self) -> Result<()> {
		self()
	}
}

/// One interception of one target method
#[derive(Clone)]
pub struct PatchUnit {
	name: String,
	target: TargetDescriptor,
	prepare: Option<Arc<dyn Prepare>>,
	pre: Option<Arc<dyn PreStage>>,
	post: Option<Arc<dyn PostStage>>,
	rewriter: Option<Arc<dyn Rewriter>>,
	init: Option<Arc<dyn Initializer>>,
}

impl std::fmt::Debug for PatchUnit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PatchUnit")
			.field("name", &self.name)
			.field("target", &self.target.to_string())
			.field("prepare", &self.prepare.as_ref().map(|p| p.name()))
			.field("pre", &self.pre.as_ref().map(|s| s.name()))
			.field("post", &self.post.as_ref().map(|s| s.name()))
			.field("rewriter", &self.rewriter.as_ref().map(|r| r.name()))
			.field("init", &self.init.as_ref().map(|i| i.name()))
			.finish()
	}
}

impl PatchUnit {
	/// Start building a unit
	pub fn builder(name: impl Into<String>, target: TargetDescriptor) -> PatchUnitBuilder {
		PatchUnitBuilder {
			unit: Self {
				name: name.into(),
				target,
				prepare: None,
				pre: None,
				post: None,
				rewriter: None,
				init: None,
			},
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub const fn target(&self) -> &TargetDescriptor {
		&self.target
	}

	#[must_use]
	pub fn preparation(&self) -> Option<&Arc<dyn Prepare>> {
		self.prepare.as_ref()
	}

	#[must_use]
	pub fn pre_stage(&self) -> Option<&Arc<dyn PreStage>> {
		self.pre.as_ref()
	}

	#[must_use]
	pub fn post_stage(&self) -> Option<&Arc<dyn PostStage>> {
		self.post.as_ref()
	}

	#[must_use]
	pub fn rewriter(&self) -> Option<&Arc<dyn Rewriter>> {
		self.rewriter.as_ref()
	}

	#[must_use]
	pub fn initializer(&self) -> Option<&Arc<dyn Initializer>> {
		self.init.as_ref()
	}

	/// Whether the unit wraps its target with stages
	#[must_use]
	pub const fn wraps(&self) -> bool {
		self.pre.is_some() || self.post.is_some()
	}
}

/// Builder for [`PatchUnit`]
#[derive(Debug)]
#[must_use]
pub struct PatchUnitBuilder {
	unit: PatchUnit,
}

impl PatchUnitBuilder {
	/// Set the preparation check
	pub fn prepare<P: Prepare + 'static>(mut self, prepare: P) -> Self {
		self.unit.prepare = Some(Arc::new(prepare));
		self
	}

	/// Set the pre-stage
	pub fn pre<S: PreStage + 'static>(mut self, stage: S) -> Self {
		self.unit.pre = Some(Arc::new(stage));
		self
	}

	/// Set the post-stage
	pub fn post<S: PostStage + 'static>(mut self, stage: S) -> Self {
		self.unit.post = Some(Arc::new(stage));
		self
	}

	/// Set the instruction rewriter
	pub fn rewriter<R: Rewriter + 'static>(mut self, rewriter: R) -> Self {
		self.unit.rewriter = Some(Arc::new(rewriter));
		self
	}

	/// Set the one-time initializer
	pub fn init<I: Initializer + 'static>(mut self, init: I) -> Self {
		self.unit.init = Some(Arc::new(init));
		self
	}

	/// Finish the unit
	pub fn build(self) -> PatchUnit {
		self.unit
	}
}
