//! Native handle registry
//!
//! This module tracks the codec plugin loaded into each native audio
//! system instance, and the log callback trampoline handed to the native
//! side. All mutations happen under one lock, and [`unload_all`] is the
//! only path that releases the trampoline's keep-alive token once it has
//! been handed out.
//!
//! [`unload_all`]: NativeHandleRegistry::unload_all

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use crate::call::CallContext;
use crate::ffi::{self, LogCallback, PluginId, PluginLoader, ResultCode, SystemHandle};
use crate::patch::Initializer;
use crate::patcher::{PatchError, PostStage, Result};

/// A plugin loaded into one native system instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandleEntry {
	/// The native system the plugin was loaded into
	pub system: SystemHandle,
	/// Registration id returned by the native side
	pub plugin: PluginId,
}

/// Keeps the managed side of the log trampoline alive
///
/// Dropping the token does not release it; release is explicit so the
/// registry controls exactly when native code may no longer reach it.
#[derive(Debug)]
pub struct KeepAlive {
	generation: u64,
}

impl KeepAlive {
	fn acquire(sink: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
		Self {
			generation: ffi::install_log_sink(sink),
		}
	}

	fn release(self) {
		ffi::release_log_sink(self.generation);
	}
}

/// Native-callable log entry point plus the token keeping it valid
#[derive(Debug)]
pub struct CallbackTrampoline {
	address: LogCallback,
	keep_alive: KeepAlive,
}

impl CallbackTrampoline {
	/// Allocate the trampoline, publishing `sink` behind it
	fn allocate(sink: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
		Self {
			address: ffi::native_log_trampoline,
			keep_alive: KeepAlive::acquire(sink),
		}
	}

	/// Address handed to native code
	#[must_use]
	pub const fn address(&self) -> LogCallback {
		self.address
	}
}

#[derive(Debug, Default)]
struct RegistryState {
	entries: HashMap<SystemHandle, PluginId>,
	trampoline: Option<CallbackTrampoline>,
}

/// Tracks native plugin handles and the log callback trampoline
pub struct NativeHandleRegistry {
	loader: Arc<dyn PluginLoader>,
	plugin_path: PathBuf,
	priority: u32,
	sink: Arc<dyn Fn(&str) + Send + Sync>,
	state: Mutex<RegistryState>,
}

impl std::fmt::Debug for NativeHandleRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		f.debug_struct("NativeHandleRegistry")
			.field("loader", &self.loader.name())
			.field("plugin_path", &self.plugin_path)
			.field("priority", &self.priority)
			.field("entries", &state.entries.len())
			.field("callback_registered", &state.trampoline.is_some())
			.finish()
	}
}

impl NativeHandleRegistry {
	/// Create an empty registry loading `plugin_path` at `priority`
	pub fn new(loader: Arc<dyn PluginLoader>, plugin_path: impl Into<PathBuf>, priority: u32) -> Self {
		Self {
			loader,
			plugin_path: plugin_path.into(),
			priority,
			sink: Arc::new(ffi::trace_native_message),
			state: Mutex::new(RegistryState::default()),
		}
	}

	/// Route native log messages to `sink` instead of tracing
	#[must_use]
	pub fn with_log_sink<F>(mut self, sink: F) -> Self
	where
		F: Fn(&str) + Send + Sync + 'static,
	{
		self.sink = Arc::new(sink);
		self
	}

	#[must_use]
	pub fn plugin_path(&self) -> &Path {
		&self.plugin_path
	}

	#[must_use]
	pub const fn priority(&self) -> u32 {
		self.priority
	}

	/// Register the native log callback
	///
	/// The keep-alive token is allocated before the native side learns the
	/// callback address. If registration fails the token is released again
	/// and native diagnostics stay off; nothing else is affected.
	pub fn register_callback(&self) -> Result<()> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

		if state.trampoline.is_some() {
			debug!("Native log callback already registered");
			return Ok(());
		}

		let trampoline = CallbackTrampoline::allocate(Arc::clone(&self.sink));
		let address = trampoline.address();

		let registered = self.native("register_log_callback", false, |loader| {
			loader.register_log_callback(address)
		});

		if registered {
			debug!("Native log callback registered");
			state.trampoline = Some(trampoline);
			Ok(())
		} else {
			// The native side never saw the address, so the token can go now
			trampoline.keep_alive.release();
			warn!("Failed to register codec native logging callback.");
			Err(PatchError::CallbackRegistrationFailure)
		}
	}

	/// Load the configured plugin into `system`
	pub fn load_plugin(&self, system: SystemHandle) -> Result<NativeHandleEntry> {
		self.load_plugin_at(system, &self.plugin_path)
	}

	/// Load the plugin at `path` into `system`
	///
	/// A system already carrying a plugin keeps its existing entry.
	pub fn load_plugin_at(&self, system: SystemHandle, path: &Path) -> Result<NativeHandleEntry> {
		if !self.native("is_valid", false, |loader| loader.is_valid(system)) {
			warn!("Cannot apply codec to handleless native system {}", system);
			return Err(PatchError::InvalidSystemHandle);
		}

		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

		if let Some(plugin) = state.entries.get(&system) {
			debug!("System {} already has plugin {}", system, plugin);
			return Ok(NativeHandleEntry {
				system,
				plugin: *plugin,
			});
		}

		info!("Loading plugin from {}", path.display());

		let (code, plugin) = self.native("load", (ResultCode::UNAVAILABLE, PluginId(0)), |loader| {
			loader.load(system, path, self.priority)
		});
		if !code.is_ok() {
			error!("Failed to load codec plugin into system {}: {}", system, code);
			return Err(PatchError::NativeLoadFailure { code });
		}

		info!("Codec registered to native system {} with handle {}.", system, plugin);
		state.entries.insert(system, plugin);
		Ok(NativeHandleEntry { system, plugin })
	}

	/// Unload every recorded plugin, then release the log callback
	///
	/// Safe on an empty registry. Native unload failures are logged and do
	/// not stop the teardown. Returns the number of entries processed.
	pub fn unload_all(&self) -> usize {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		let entries: Vec<(SystemHandle, PluginId)> = state.entries.drain().collect();

		for (system, plugin) in &entries {
			let code = self.native("unload", ResultCode::UNAVAILABLE, |loader| loader.unload(*system, *plugin));
			if code.is_ok() {
				debug!("Unloaded plugin {} from system {}", plugin, system);
			} else {
				error!(
					"{} (system {}, plugin {})",
					PatchError::NativeUnloadFailure { code },
					system,
					plugin
				);
			}
		}

		if let Some(trampoline) = state.trampoline.take() {
			self.native("clear_log_callback", (), |loader| loader.clear_log_callback());
			trampoline.keep_alive.release();
			debug!("Native log callback released");
		}

		if !entries.is_empty() {
			info!("Unloaded {} native plugin(s)", entries.len());
		}
		entries.len()
	}

	/// Call into the loader, substituting `fallback` if it panics
	fn native<T, F>(&self, operation: &str, fallback: T, call: F) -> T
	where
		F: FnOnce(&dyn PluginLoader) -> T,
	{
		catch_unwind(AssertUnwindSafe(|| call(self.loader.as_ref()))).unwrap_or_else(|_| {
			error!("{} panicked during {}", self.loader.name(), operation);
			fallback
		})
	}

	/// Number of recorded entries
	#[must_use]
	pub fn len(&self) -> usize {
		self.state.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Snapshot of the recorded entries, in no particular order
	#[must_use]
	pub fn entries(&self) -> Vec<NativeHandleEntry> {
		let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		state
			.entries
			.iter()
			.map(|(system, plugin)| NativeHandleEntry {
				system: *system,
				plugin: *plugin,
			})
			.collect()
	}

	/// Whether a log callback is currently registered
	#[must_use]
	pub fn has_callback(&self) -> bool {
		self.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.trampoline
			.is_some()
	}
}

impl Drop for NativeHandleRegistry {
	fn drop(&mut self) {
		let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
		if !state.entries.is_empty() || state.trampoline.is_some() {
			warn!("Native handle registry dropped while populated, unloading");
			self.unload_all();
		}
	}
}

/// Post-stage loading the plugin into the system a call produced
///
/// `extract` finds the native system handle in the call context, usually
/// on the freshly constructed instance.
pub struct PluginAttach<F> {
	registry: Arc<NativeHandleRegistry>,
	extract: F,
}

impl<F> PluginAttach<F>
where
	F: Fn(&CallContext) -> Option<SystemHandle> + Send + Sync,
{
	pub const fn new(registry: Arc<NativeHandleRegistry>, extract: F) -> Self {
		Self { registry, extract }
	}
}

impl<F> PostStage for PluginAttach<F>
where
	F: Fn(&CallContext) -> Option<SystemHandle> + Send + Sync,
{
	fn after(&self, ctx: &mut CallContext) {
		let system = (self.extract)(ctx).unwrap_or(SystemHandle::NULL);
		// Failures are logged by the registry
		let _ = self.registry.load_plugin(system);
	}

	fn name(&self) -> &'static str {
		"PluginAttach"
	}
}

/// Initializer registering the native log callback
#[derive(Debug, Clone)]
pub struct CallbackInit {
	registry: Arc<NativeHandleRegistry>,
}

impl CallbackInit {
	#[must_use]
	pub const fn new(registry: Arc<NativeHandleRegistry>) -> Self {
		Self { registry }
	}
}

impl Initializer for CallbackInit {
	fn initialize(&self) -> Result<()> {
		self.registry.register_callback()
	}

	fn name(&self) -> &'static str {
		"CallbackInit"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ffi::SINK_TEST_LOCK;
	use std::sync::MutexGuard;

	#[derive(Debug, Default)]
	struct Recorder {
		loads: Vec<SystemHandle>,
		unloads: Vec<(SystemHandle, PluginId)>,
		registrations: usize,
		clears: usize,
	}

	#[derive(Debug, Default)]
	struct MockLoader {
		calls: Mutex<Recorder>,
		fail_load: bool,
		fail_unload: bool,
		fail_register: bool,
		panic_unload: bool,
	}

	impl PluginLoader for MockLoader {
		fn load(&self, system: SystemHandle, _path: &Path, _priority: u32) -> (ResultCode, PluginId) {
			let mut calls = self.calls.lock().unwrap();
			calls.loads.push(system);
			if self.fail_load {
				(ResultCode(18), PluginId(0))
			} else {
				(ResultCode::OK, PluginId(calls.loads.len() as u32))
			}
		}

		fn unload(&self, system: SystemHandle, plugin: PluginId) -> ResultCode {
			self.calls.lock().unwrap().unloads.push((system, plugin));
			assert!(!self.panic_unload, "engine already shut down");
			if self.fail_unload { ResultCode(30) } else { ResultCode::OK }
		}

		fn register_log_callback(&self, _callback: LogCallback) -> bool {
			self.calls.lock().unwrap().registrations += 1;
			!self.fail_register
		}

		fn clear_log_callback(&self) {
			self.calls.lock().unwrap().clears += 1;
		}
	}

	fn registry(loader: MockLoader) -> (Arc<MockLoader>, NativeHandleRegistry) {
		let loader = Arc::new(loader);
		let registry = NativeHandleRegistry::new(Arc::clone(&loader) as Arc<dyn PluginLoader>, "codec.so", 2600);
		(loader, registry)
	}

	fn sink_lock() -> MutexGuard<'static, ()> {
		SINK_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
	}

	#[test]
	fn unload_all_balances_loads() {
		let (loader, registry) = registry(MockLoader::default());
		registry.load_plugin(SystemHandle(0x100)).unwrap();
		registry.load_plugin(SystemHandle(0x200)).unwrap();
		assert_eq!(registry.len(), 2);

		assert_eq!(registry.unload_all(), 2);
		assert!(registry.is_empty());

		let calls = loader.calls.lock().unwrap();
		let mut unloaded: Vec<SystemHandle> = calls.unloads.iter().map(|(s, _)| *s).collect();
		unloaded.sort();
		assert_eq!(unloaded, vec![SystemHandle(0x100), SystemHandle(0x200)]);
	}

	#[test]
	fn invalid_handle_is_rejected_without_native_call() {
		let (loader, registry) = registry(MockLoader::default());
		assert!(matches!(
			registry.load_plugin(SystemHandle::NULL),
			Err(PatchError::InvalidSystemHandle)
		));
		assert!(loader.calls.lock().unwrap().loads.is_empty());
	}

	#[test]
	fn failed_load_records_nothing() {
		let (_loader, registry) = registry(MockLoader {
			fail_load: true,
			..MockLoader::default()
		});
		assert!(matches!(
			registry.load_plugin(SystemHandle(0x10)),
			Err(PatchError::NativeLoadFailure { code: ResultCode(18) })
		));
		assert!(registry.is_empty());
	}

	#[test]
	fn same_system_is_loaded_once() {
		let (loader, registry) = registry(MockLoader::default());
		let first = registry.load_plugin(SystemHandle(0x10)).unwrap();
		let second = registry.load_plugin(SystemHandle(0x10)).unwrap();
		assert_eq!(first, second);
		assert_eq!(loader.calls.lock().unwrap().loads.len(), 1);
	}

	#[test]
	fn failed_registration_releases_token() {
		let _guard = sink_lock();
		let (loader, registry) = registry(MockLoader {
			fail_register: true,
			..MockLoader::default()
		});
		assert!(matches!(
			registry.register_callback(),
			Err(PatchError::CallbackRegistrationFailure)
		));
		assert!(!registry.has_callback());

		// Plugins still load without diagnostics
		assert!(registry.load_plugin(SystemHandle(0x10)).is_ok());
		registry.unload_all();
		assert_eq!(loader.calls.lock().unwrap().clears, 0);
	}

	#[test]
	fn unload_all_releases_callback_once() {
		let _guard = sink_lock();
		let (loader, registry) = registry(MockLoader {
			fail_load: true,
			..MockLoader::default()
		});
		registry.register_callback().unwrap();
		registry.register_callback().unwrap();
		assert!(registry.load_plugin(SystemHandle(0x10)).is_err());

		registry.unload_all();
		registry.unload_all();

		let calls = loader.calls.lock().unwrap();
		assert_eq!(calls.registrations, 1);
		assert_eq!(calls.clears, 1);
		assert!(calls.unloads.is_empty());
		assert!(!registry.has_callback());
	}

	#[test]
	fn unload_failures_do_not_stop_teardown() {
		let (loader, registry) = registry(MockLoader {
			fail_unload: true,
			..MockLoader::default()
		});
		registry.load_plugin(SystemHandle(0x1)).unwrap();
		registry.load_plugin(SystemHandle(0x2)).unwrap();
		assert_eq!(registry.unload_all(), 2);
		assert!(registry.is_empty());
		assert_eq!(loader.calls.lock().unwrap().unloads.len(), 2);
	}

	#[test]
	fn empty_unload_makes_no_native_calls() {
		let (loader, registry) = registry(MockLoader::default());
		assert_eq!(registry.unload_all(), 0);
		let calls = loader.calls.lock().unwrap();
		assert!(calls.unloads.is_empty());
		assert_eq!(calls.clears, 0);
	}

	#[test]
	fn panicking_unload_still_clears_everything() {
		let _guard = sink_lock();
		let (loader, registry) = registry(MockLoader {
			panic_unload: true,
			..MockLoader::default()
		});
		registry.register_callback().unwrap();
		registry.load_plugin(SystemHandle(0x1)).unwrap();
		registry.load_plugin(SystemHandle(0x2)).unwrap();

		assert_eq!(registry.unload_all(), 2);
		assert!(registry.is_empty());
		assert!(!registry.has_callback());
		let calls = loader.calls.lock().unwrap();
		assert_eq!(calls.unloads.len(), 2);
		assert_eq!(calls.clears, 1);
	}

	#[test]
	fn teardown_of_one_registry_keeps_another_sink_live() {
		let _guard = sink_lock();
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink_seen = Arc::clone(&seen);
		let first = NativeHandleRegistry::new(Arc::new(MockLoader::default()), "first.so", 2600)
			.with_log_sink(move |msg| sink_seen.lock().unwrap().push(msg.to_string()));
		let (_loader, second) = registry(MockLoader::default());

		first.register_callback().unwrap();
		second.register_callback().unwrap();
		second.unload_all();

		let msg = b"codec: stream opened";
		unsafe { ffi::native_log_trampoline(msg.as_ptr().cast(), msg.len() as libc::c_int) };
		assert_eq!(*seen.lock().unwrap(), vec!["codec: stream opened".to_string()]);

		first.unload_all();
		unsafe { ffi::native_log_trampoline(msg.as_ptr().cast(), msg.len() as libc::c_int) };
		assert_eq!(seen.lock().unwrap().len(), 1);
	}
}
