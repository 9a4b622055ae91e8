//! Builder for creating patchers
//!
//! This module contains the `PatcherBuilder` struct and related
//! functionality for configuring and building patchers.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::engine::InterceptionEngine;
use crate::core::registry::NativeHandleRegistry;
use crate::ffi::PluginLoader;
use crate::host::HostRuntime;
use crate::patch::PatchUnit;
use crate::patcher::{PatchError, Patcher, Result};

/// Default codec plugin priority handed to the native loader
pub const DEFAULT_PLUGIN_PRIORITY: u32 = 2600;

/// Configuration for a patcher
#[derive(Debug, Clone)]
pub struct PatcherConfig {
	/// Mod installation directory the plugin is loaded from
	pub mod_dir: PathBuf,
	/// File name of the native codec plugin
	pub plugin_file: String,
	/// Priority passed to the native plugin loader
	pub plugin_priority: u32,
	/// Whether enabling installs the tracing subscriber
	pub init_logging: bool,
	/// Whether every wrapped call is traced
	pub trace_calls: bool,
}

impl Default for PatcherConfig {
	fn default() -> Self {
		Self {
			mod_dir: PathBuf::from("."),
			plugin_file: format!(
				"{}fmod_win32_mf{}",
				std::env::consts::DLL_PREFIX,
				std::env::consts::DLL_SUFFIX
			),
			plugin_priority: DEFAULT_PLUGIN_PRIORITY,
			init_logging: true,
			trace_calls: false,
		}
	}
}

impl PatcherConfig {
	/// Full path of the native codec plugin
	#[must_use]
	pub fn plugin_path(&self) -> PathBuf {
		self.mod_dir.join(&self.plugin_file)
	}
}

/// Builder for creating patchers
///
/// Units are installed in the order they are added.
#[derive(Default)]
pub struct PatcherBuilder {
	config: PatcherConfig,
	host: Option<Arc<dyn HostRuntime>>,
	registry: Option<Arc<NativeHandleRegistry>>,
	/// Whether `registry` was derived from `config` by `native_loader`
	registry_from_config: bool,
	units: Vec<PatchUnit>,
}

impl std::fmt::Debug for PatcherBuilder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PatcherBuilder")
			.field("config", &self.config)
			.field("host", &self.host.as_ref().map(|h| h.name()))
			.field("registry", &self.registry.is_some())
			.field("units", &format!("[{} units]", self.units.len()))
			.finish()
	}
}

impl PatcherBuilder {
	/// Create a new patcher builder with default settings
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Set the mod installation directory
	#[must_use]
	pub fn mod_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.config.mod_dir = dir.into();
		self
	}

	/// Set the codec plugin file name
	#[must_use]
	pub fn plugin_file(mut self, file: impl Into<String>) -> Self {
		self.config.plugin_file = file.into();
		self
	}

	/// Set the codec plugin priority
	#[must_use]
	pub const fn plugin_priority(mut self, priority: u32) -> Self {
		self.config.plugin_priority = priority;
		self
	}

	/// Enable or disable tracing subscriber installation on enable
	#[must_use]
	pub const fn init_logging(mut self, init: bool) -> Self {
		self.config.init_logging = init;
		self
	}

	/// Enable or disable call tracing
	#[must_use]
	pub const fn trace_calls(mut self, trace: bool) -> Self {
		self.config.trace_calls = trace;
		self
	}

	/// Set the host runtime patch units are installed on
	#[must_use]
	pub fn host<H: HostRuntime + 'static>(mut self, host: Arc<H>) -> Self {
		self.host = Some(host as Arc<dyn HostRuntime>);
		self
	}

	/// Set the native plugin loader
	///
	/// This creates the native handle registry from the current plugin path
	/// and priority, so units can capture it before the patcher is built.
	/// Set the mod directory, plugin file and priority first: changing them
	/// afterwards makes [`build`] fail.
	///
	/// [`build`]: Self::build
	#[must_use]
	pub fn native_loader<L: PluginLoader + 'static>(mut self, loader: Arc<L>) -> Self {
		self.registry = Some(Arc::new(NativeHandleRegistry::new(
			loader,
			self.config.plugin_path(),
			self.config.plugin_priority,
		)));
		self.registry_from_config = true;
		self
	}

	/// Use an externally built native handle registry
	///
	/// The registry keeps its own plugin path and priority.
	#[must_use]
	pub fn with_registry(mut self, registry: Arc<NativeHandleRegistry>) -> Self {
		self.registry = Some(registry);
		self.registry_from_config = false;
		self
	}

	/// The native handle registry, for units that need to capture it
	#[must_use]
	pub fn registry(&self) -> Option<Arc<NativeHandleRegistry>> {
		self.registry.clone()
	}

	/// Add a patch unit
	#[must_use]
	pub fn unit(mut self, unit: PatchUnit) -> Self {
		self.units.push(unit);
		self
	}

	/// Build the patcher
	pub fn build(self) -> Result<Patcher> {
		let host = self
			.host
			.ok_or_else(|| PatchError::Other("no host runtime configured".into()))?;

		if let Some(registry) = self.registry.as_ref().filter(|_| self.registry_from_config) {
			let path = self.config.plugin_path();
			if registry.plugin_path() != path || registry.priority() != self.config.plugin_priority {
				return Err(PatchError::Other(format!(
					"plugin settings changed after native_loader: registry loads {} at priority {}, config says {} at priority {}",
					registry.plugin_path().display(),
					registry.priority(),
					path.display(),
					self.config.plugin_priority
				)));
			}
		}

		let mut names = HashSet::new();
		for unit in &self.units {
			if !names.insert(unit.name()) {
				return Err(PatchError::AlreadyRegistered(unit.name().to_string()));
			}
		}

		let engine = InterceptionEngine::new(host, self.units, self.config.trace_calls);
		Ok(Patcher::new(self.config, engine, self.registry))
	}
}
