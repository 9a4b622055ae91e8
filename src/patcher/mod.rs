//! Patcher functionality
//!
//! This module contains the lifecycle controller and the pieces patch
//! units are built from: stages, preparation checks, and the per-call
//! wrapper pipeline.

mod builder;
mod error;
mod prepare;
mod stage;
mod wrapper;

pub use builder::{DEFAULT_PLUGIN_PRIORITY, PatcherBuilder, PatcherConfig};
pub use error::{PatchError, Result};
pub use prepare::{AlwaysApply, Applicability, NeverApply, Prepare};
pub use stage::{PostStage, PreStage, TracingStage};
pub use wrapper::{CallStats, Wrapper};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::core::engine::{InstallReport, InterceptionEngine};
use crate::core::registry::NativeHandleRegistry;

/// State of a [`Patcher`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
	#[default]
	Disabled,
	Enabled,
}

/// Lifecycle controller
///
/// Drives the interception engine and the native handle registry in
/// response to enable and disable signals from the host. It is created
/// disabled; see [`Patcher::enable`].
#[derive(Debug)]
pub struct Patcher {
	config: PatcherConfig,
	engine: InterceptionEngine,
	registry: Option<Arc<NativeHandleRegistry>>,
	state: LifecycleState,
}

impl Patcher {
	/// Create a new patcher
	///
	/// This is typically called by the `PatcherBuilder` and not directly.
	pub(crate) const fn new(
		config: PatcherConfig,
		engine: InterceptionEngine,
		registry: Option<Arc<NativeHandleRegistry>>,
	) -> Self {
		Self {
			config,
			engine,
			registry,
			state: LifecycleState::Disabled,
		}
	}

	/// Install every unit, then run the installed units' initializers
	///
	/// Per-unit failures are logged and reported, never returned. Enabling
	/// an enabled patcher does nothing and returns an empty report.
	pub fn enable(&mut self) -> InstallReport {
		if self.config.init_logging {
			crate::util::init_logging();
		}

		if self.state == LifecycleState::Enabled {
			debug!("Patcher already enabled");
			return InstallReport::default();
		}

		info!("Enabling patcher with {} unit(s)", self.engine.units().len());
		let report = self.engine.install_all();

		for unit in self.engine.units() {
			if !report.installed.iter().any(|name| name == unit.name()) {
				continue;
			}
			let Some(init) = unit.initializer() else {
				continue;
			};

			match catch_unwind(AssertUnwindSafe(|| init.initialize())) {
				Ok(Ok(())) => debug!("{}: initializer {} done", unit.name(), init.name()),
				Ok(Err(e)) => error!("{}: initializer {} failed: {}", unit.name(), init.name(), e),
				Err(_) => error!("{}: initializer {} panicked", unit.name(), init.name()),
			}
		}

		self.state = LifecycleState::Enabled;
		info!("Patcher enabled");
		report
	}

	/// Release native resources, then uninstall every unit
	///
	/// Always runs the full teardown, whatever the current state.
	pub fn disable(&mut self) {
		info!("Disabling patcher");

		// Resources go first, while wrappers still see a consistent set
		if let Some(registry) = &self.registry {
			registry.unload_all();
		}
		self.engine.uninstall_all();

		self.state = LifecycleState::Disabled;
		info!("Patcher disabled");
	}

	/// Host toggle entry point
	///
	/// Always reports success; internal failures are degradations.
	pub fn toggle(&mut self, enable: bool) -> bool {
		if enable {
			self.enable();
		} else {
			self.disable();
		}
		true
	}

	#[must_use]
	pub const fn state(&self) -> LifecycleState {
		self.state
	}

	#[must_use]
	pub fn is_enabled(&self) -> bool {
		self.state == LifecycleState::Enabled
	}

	#[must_use]
	pub const fn engine(&self) -> &InterceptionEngine {
		&self.engine
	}

	#[must_use]
	pub fn registry(&self) -> Option<&Arc<NativeHandleRegistry>> {
		self.registry.as_ref()
	}

	#[must_use]
	pub const fn config(&self) -> &PatcherConfig {
		&self.config
	}
}

impl Drop for Patcher {
	fn drop(&mut self) {
		if self.state == LifecycleState::Enabled {
			self.disable();
		}
	}
}
