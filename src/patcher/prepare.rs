//! Preparation checks
//!
//! This module contains the `Prepare` trait and implementations for
//! common checks. A preparation check runs once the unit's target has
//! resolved and decides whether the unit is installed at all.

use crate::host::MethodHandle;

/// Verdict of a preparation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applicability {
	/// Install the unit
	Apply,
	/// Skip the unit for the given reason
	Decline(String),
}

impl Applicability {
	#[must_use]
	pub const fn is_apply(&self) -> bool {
		matches!(self, Self::Apply)
	}
}

/// Trait for deciding whether a patch unit applies
pub trait Prepare: Send + Sync {
	/// Decide whether the unit should be installed on `original`
	///
	/// This may locate collaborators the stages need later; declining skips
	/// the unit without affecting the rest of the install pass.
	fn prepare(&self, original: &MethodHandle) -> Applicability;

	/// Get the name of the check
	///
	/// This is used for debugging and logging purposes.
	fn name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}
}

impl<F> Prepare for F
where
	F: Fn(&MethodHandle) -> Applicability + Send + Sync,
{
	fn prepare(&self, original: &MethodHandle) -> Applicability {
		self(original)
	}
}

/// Check that always applies
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysApply;

impl AlwaysApply {
	/// Create a new `AlwaysApply`
	#[must_use]
	pub const fn new() -> Self {
		Self
	}
}

impl Prepare for AlwaysApply {
	fn prepare(&self, _original: &MethodHandle) -> Applicability {
		Applicability::Apply
	}

	fn name(&self) -> &'static str {
		"AlwaysApply"
	}
}

/// Check that always declines
#[derive(Debug, Clone, Default)]
pub struct NeverApply {
	reason: String,
}

impl NeverApply {
	/// Create a new `NeverApply` with the reason to report
	pub fn new(reason: impl Into<String>) -> Self {
		Self { reason: reason.into() }
	}
}

impl Prepare for NeverApply {
	fn prepare(&self, _original: &MethodHandle) -> Applicability {
		Applicability::Decline(self.reason.clone())
	}

	fn name(&self) -> &'static str {
		"NeverApply"
	}
}
