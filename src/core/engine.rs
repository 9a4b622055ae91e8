//! Interception engine
//!
//! The engine resolves each registered [`PatchUnit`]'s target against the
//! host runtime, runs its preparation check, and installs its rewritten
//! body and its stage wrapper. Every failure is scoped to its unit: the
//! install pass logs it and carries on with the next unit.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use crate::call::TargetDescriptor;
use crate::host::{HostRuntime, InstallToken, MethodHandle};
use crate::patch::PatchUnit;
use crate::patcher::{Applicability, PatchError, Result, Wrapper};

/// Runtime binding of a patch unit to its resolved target
///
/// Holds the tokens needed to undo every modification. Uninstalling drains
/// the tokens, so a second uninstall is a no-op.
#[derive(Debug)]
pub struct InstalledPatch {
	unit: String,
	method: MethodHandle,
	tokens: Vec<InstallToken>,
	rewrite_applied: Option<bool>,
}

impl InstalledPatch {
	#[must_use]
	pub fn unit(&self) -> &str {
		&self.unit
	}

	#[must_use]
	pub const fn method(&self) -> &MethodHandle {
		&self.method
	}

	/// Whether any modification is still in place
	#[must_use]
	pub fn is_active(&self) -> bool {
		!self.tokens.is_empty()
	}

	/// `Some(applied)` if the unit has a rewriter
	#[must_use]
	pub const fn rewrite_applied(&self) -> Option<bool> {
		self.rewrite_applied
	}
}

/// Summary of one install pass
#[derive(Debug, Default)]
pub struct InstallReport {
	/// Units installed in this pass, in install order
	pub installed: Vec<String>,
	/// Units whose preparation check declined, with the reason
	pub skipped: Vec<(String, String)>,
	/// Units that failed to resolve or install
	pub failed: Vec<(String, PatchError)>,
	/// Installed units whose rewriter found nothing to change
	pub degraded: Vec<String>,
}

impl InstallReport {
	/// Whether every unit installed cleanly
	#[must_use]
	pub fn is_clean(&self) -> bool {
		self.skipped.is_empty() && self.failed.is_empty() && self.degraded.is_empty()
	}

	/// Failure recorded for `unit`, if any
	#[must_use]
	pub fn failure(&self, unit: &str) -> Option<&PatchError> {
		self.failed.iter().find(|(name, _)| name == unit).map(|(_, e)| e)
	}
}

/// Installs and removes patch units on a host runtime
pub struct InterceptionEngine {
	host: Arc<dyn HostRuntime>,
	units: Vec<Arc<PatchUnit>>,
	installed: Mutex<Vec<InstalledPatch>>,
	trace_calls: bool,
}

impl std::fmt::Debug for InterceptionEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InterceptionEngine")
			.field("host", &self.host.name())
			.field("units", &self.units.iter().map(|u| u.name()).collect::<Vec<_>>())
			.field("installed", &self.installed_units())
			.field("trace_calls", &self.trace_calls)
			.finish()
	}
}

impl InterceptionEngine {
	/// Create an engine over `units`, installed in the given order
	#[must_use]
	pub fn new(host: Arc<dyn HostRuntime>, units: Vec<PatchUnit>, trace_calls: bool) -> Self {
		Self {
			host,
			units: units.into_iter().map(Arc::new).collect(),
			installed: Mutex::new(Vec::new()),
			trace_calls,
		}
	}

	/// The registered units, in install order
	#[must_use]
	pub fn units(&self) -> &[Arc<PatchUnit>] {
		&self.units
	}

	/// Resolve a selector to the unique method it names
	pub fn resolve(&self, target: &TargetDescriptor) -> Result<MethodHandle> {
		let mut candidates: Vec<MethodHandle> = self
			.host_call("lookup", |host| Ok(host.lookup(target)))?
			.into_iter()
			.filter(|method| target.matches(&method.sig))
			.collect();

		match candidates.len() {
			0 => Err(PatchError::TargetNotFound(target.to_string())),
			1 => Ok(candidates.remove(0)),
			count => Err(PatchError::AmbiguousTarget {
				target: target.to_string(),
				count,
			}),
		}
	}

	/// Install one unit without recording it
	///
	/// The returned patch must eventually be passed to [`uninstall`].
	///
	/// [`uninstall`]: Self::uninstall
	pub fn install(&self, unit: &PatchUnit) -> Result<InstalledPatch> {
		let method = self.resolve(unit.target())?;
		debug!("{}: resolved {} to {}", unit.name(), unit.target(), method);

		if let Some(prepare) = unit.preparation() {
			let verdict = catch_unwind(AssertUnwindSafe(|| prepare.prepare(&method)))
				.unwrap_or_else(|_| Applicability::Decline(format!("preparation check {} panicked", prepare.name())));
			if let Applicability::Decline(reason) = verdict {
				return Err(PatchError::PreparationDeclined(reason));
			}
		}

		let mut patch = InstalledPatch {
			unit: unit.name().to_string(),
			method,
			tokens: Vec::new(),
			rewrite_applied: None,
		};

		if let Some(rewriter) = unit.rewriter() {
			let applied = match self.apply_rewrite(unit, &patch.method, rewriter.as_ref()) {
				Ok(Some(token)) => {
					patch.tokens.push(token);
					true
				},
				Ok(None) => false,
				Err(e) => {
					self.rollback(&mut patch);
					return Err(e);
				},
			};
			patch.rewrite_applied = Some(applied);
		}

		if unit.wraps() || self.trace_calls {
			let wrapper = Wrapper::new(
				unit.name(),
				unit.pre_stage().cloned(),
				unit.post_stage().cloned(),
				self.trace_calls,
			);
			let installed = self.host_call("install_wrapper", |host| {
				host.install_wrapper(&patch.method, Arc::new(wrapper))
			});
			match installed {
				Ok(token) => patch.tokens.push(token),
				Err(e) => {
					self.rollback(&mut patch);
					return Err(e);
				},
			}
		}

		if patch.tokens.is_empty() && patch.rewrite_applied.is_none() {
			debug!("{}: unit carries no modification", unit.name());
		}

		Ok(patch)
	}

	/// Rewrite the target's body; `None` if the rewriter changed nothing
	fn apply_rewrite(
		&self,
		unit: &PatchUnit,
		method: &MethodHandle,
		rewriter: &dyn crate::core::rewrite::Rewriter,
	) -> Result<Option<InstallToken>> {
		let body = self
			.host_call("method_body", |host| Ok(host.method_body(method)))?
			.ok_or_else(|| PatchError::Host(format!("{method} exposes no instruction body")))?;

		let rewrite = catch_unwind(AssertUnwindSafe(|| rewriter.rewrite(body)))
			.map_err(|_| PatchError::Host(format!("rewriter {} panicked", rewriter.name())))?;

		if !rewrite.applied {
			warn!(
				"{}: {}",
				unit.name(),
				PatchError::RewriteNotApplied(method.to_string())
			);
			return Ok(None);
		}

		info!(
			"{}: rewrote {} instruction(s) of {}",
			unit.name(),
			rewrite.replaced,
			method
		);
		self.host_call("replace_body", |host| host.replace_body(method, rewrite.instructions))
			.map(Some)
	}

	/// Call into the host runtime, turning a panic into a `Host` error
	fn host_call<T, F>(&self, operation: &str, call: F) -> Result<T>
	where
		F: FnOnce(&dyn HostRuntime) -> Result<T>,
	{
		catch_unwind(AssertUnwindSafe(|| call(self.host.as_ref()))).unwrap_or_else(|_| {
			Err(PatchError::Host(format!(
				"{} panicked during {operation}",
				self.host.name()
			)))
		})
	}

	fn rollback(&self, patch: &mut InstalledPatch) {
		while let Some(token) = patch.tokens.pop() {
			if let Err(e) = self.host_call("remove", |host| host.remove(token)) {
				error!("{}: failed to roll back modification: {}", patch.unit, e);
			}
		}
	}

	/// Remove every modification of one installed patch
	///
	/// Modifications are removed in reverse install order. Calling this
	/// again on the same patch does nothing.
	pub fn uninstall(&self, patch: &mut InstalledPatch) {
		if !patch.is_active() {
			return;
		}

		self.rollback(patch);
		debug!("{}: uninstalled from {}", patch.unit, patch.method);
	}

	/// Install every registered unit that is not installed yet
	pub fn install_all(&self) -> InstallReport {
		let mut report = InstallReport::default();
		let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);

		for unit in &self.units {
			if installed.iter().any(|patch| patch.unit == unit.name()) {
				debug!("{}: already installed", unit.name());
				continue;
			}

			match self.install(unit) {
				Ok(patch) => {
					if patch.rewrite_applied == Some(false) {
						report.degraded.push(unit.name().to_string());
					}
					info!("{}: applied to {}", unit.name(), patch.method);
					report.installed.push(unit.name().to_string());
					installed.push(patch);
				},
				Err(PatchError::PreparationDeclined(reason)) => {
					warn!("{}: skipped, {}", unit.name(), reason);
					report.skipped.push((unit.name().to_string(), reason));
				},
				Err(e) => {
					warn!("{}: not installed: {}", unit.name(), e);
					report.failed.push((unit.name().to_string(), e));
				},
			}
		}

		info!(
			"Install pass: {} installed, {} skipped, {} failed, {} degraded",
			report.installed.len(),
			report.skipped.len(),
			report.failed.len(),
			report.degraded.len()
		);

		report
	}

	/// Uninstall every recorded patch, returning how many were removed
	pub fn uninstall_all(&self) -> usize {
		let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
		let count = installed.len();

		// Reverse install order, so stacked wrappers unwind cleanly
		while let Some(mut patch) = installed.pop() {
			self.uninstall(&mut patch);
		}

		if count > 0 {
			info!("Uninstalled {} patch(es)", count);
		}
		count
	}

	/// Names of the currently installed units, in install order
	#[must_use]
	pub fn installed_units(&self) -> Vec<String> {
		let installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
		installed.iter().map(|patch| patch.unit.clone()).collect()
	}
}
