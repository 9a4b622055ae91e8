//! Native interface
//!
//! Types shared with the native plugin side, the log callback trampoline
//! handed to native code, and the [`PluginLoader`] seam through which the
//! registry talks to the audio engine.

use libc::{c_char, c_int, c_void};
use once_cell::sync::Lazy;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Opaque handle of a native audio system instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemHandle(pub usize);

impl SystemHandle {
	pub const NULL: Self = Self(0);

	#[must_use]
	pub const fn is_null(self) -> bool {
		self.0 == 0
	}

	#[must_use]
	pub const fn as_ptr(self) -> *mut c_void {
		self.0 as *mut c_void
	}
}

impl fmt::Display for SystemHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:#x}", self.0)
	}
}

/// Registration id the native side returns for a loaded plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginId(pub u32);

impl fmt::Display for PluginId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Result code of a native call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub i32);

impl ResultCode {
	pub const OK: Self = Self(0);
	/// The entry point needed for the call could not be resolved
	pub const UNAVAILABLE: Self = Self(-1);

	#[must_use]
	pub const fn is_ok(self) -> bool {
		self.0 == Self::OK.0
	}
}

impl fmt::Display for ResultCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match *self {
			Self::OK => f.write_str("OK"),
			Self::UNAVAILABLE => f.write_str("entry point unavailable"),
			Self(code) => write!(f, "result code {code}"),
		}
	}
}

/// Signature of the native log callback
pub type LogCallback = unsafe extern "system" fn(message: *const c_char, size: c_int);

type LogSink = dyn Fn(&str) + Send + Sync;

// Managed side of the trampoline, one sink per registered callback
static LOG_SINKS: Lazy<RwLock<Vec<(u64, Arc<LogSink>)>>> = Lazy::new(|| RwLock::new(Vec::new()));

static SINK_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Publish `sink` as a target of [`native_log_trampoline`]
///
/// Returns the generation to pass to [`release_log_sink`].
pub(crate) fn install_log_sink(sink: Arc<LogSink>) -> u64 {
	let generation = SINK_GENERATION.fetch_add(1, Ordering::SeqCst);
	LOG_SINKS
		.write()
		.unwrap_or_else(PoisonError::into_inner)
		.push((generation, sink));
	generation
}

/// Withdraw the sink installed under `generation`
///
/// Other sinks stay published. Calls already running keep their own
/// reference to the sink.
pub(crate) fn release_log_sink(generation: u64) {
	LOG_SINKS
		.write()
		.unwrap_or_else(PoisonError::into_inner)
		.retain(|(live, _)| *live != generation);
}

/// Default sink: forward native messages to tracing
pub(crate) fn trace_native_message(message: &str) {
	info!(target: "patchwork_rs::native", "{}", message.trim_end());
}

/// Decode a `(pointer, size)` ANSI message from native code
///
/// # Safety
///
/// If `message` is non-null it must point to at least `size` readable bytes.
#[must_use]
pub unsafe fn decode_native_message(message: *const c_char, size: c_int) -> Option<String> {
	let len = usize::try_from(size).ok().filter(|len| *len > 0)?;
	if message.is_null() {
		return None;
	}

	let bytes = unsafe { std::slice::from_raw_parts(message.cast::<u8>(), len) };
	Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Native-callable entry point forwarding log messages to every live sink
///
/// Messages arriving while no sink is installed are dropped.
///
/// # Safety
///
/// Called by native code; `message` must satisfy [`decode_native_message`].
pub unsafe extern "system" fn native_log_trampoline(message: *const c_char, size: c_int) {
	let sinks: Vec<Arc<LogSink>> = match LOG_SINKS.read() {
		Ok(sinks) => sinks.iter().map(|(_, sink)| Arc::clone(sink)).collect(),
		Err(_) => return,
	};

	if sinks.is_empty() {
		return;
	}

	if let Some(text) = unsafe { decode_native_message(message, size) } {
		for sink in sinks {
			// Never unwind into native code
			let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(&text)));
		}
	}
}

/// Trait for the native plugin loader
///
/// All calls are synchronous single attempts. A non-OK result code is
/// reported to the caller and never turned into a panic.
pub trait PluginLoader: Send + Sync {
	/// Whether `system` refers to a live native instance
	fn is_valid(&self, system: SystemHandle) -> bool {
		!system.is_null()
	}

	/// Load the plugin at `path` into `system`
	fn load(&self, system: SystemHandle, path: &Path, priority: u32) -> (ResultCode, PluginId);

	/// Unload a previously loaded plugin
	fn unload(&self, system: SystemHandle, plugin: PluginId) -> ResultCode;

	/// Hand the log callback address to the native side
	fn register_log_callback(&self, callback: LogCallback) -> bool;

	/// Tell the native side to stop using the log callback
	fn clear_log_callback(&self) {}

	/// Get the name of the loader
	///
	/// This is used for debugging and logging purposes.
	fn name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}
}

#[cfg(unix)]
pub use dl::DlPluginLoader;

#[cfg(unix)]
mod dl {
	use super::{LogCallback, PluginId, PluginLoader, ResultCode, SystemHandle};
	use crate::patcher::{PatchError, Result};
	use libc::{c_char, c_int, c_uint, c_void};
	use std::ffi::{CStr, CString};
	use std::os::unix::ffi::OsStrExt;
	use std::path::Path;
	use tracing::{debug, error, warn};

	type LoadPluginFn = unsafe extern "system" fn(*mut c_void, *const c_char, *mut c_uint, c_uint) -> c_int;
	type UnloadPluginFn = unsafe extern "system" fn(*mut c_void, c_uint) -> c_int;
	type RegisterLogCallbackFn = unsafe extern "system" fn(LogCallback) -> bool;

	fn path_to_cstring(path: &Path) -> Result<CString> {
		CString::new(path.as_os_str().as_bytes())
			.map_err(|_| PatchError::Other(format!("path contains a NUL byte: {}", path.display())))
	}

	fn last_dl_error() -> String {
		let err = unsafe { libc::dlerror() };
		if err.is_null() {
			"unknown error".to_string()
		} else {
			unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
		}
	}

	/// A library opened with `dlopen`, closed on drop
	struct Library {
		handle: *mut c_void,
		path: String,
	}

	// SAFETY: the handle is only passed to dlsym/dlclose, which are thread-safe.
	unsafe impl Send for Library {}
	unsafe impl Sync for Library {}

	impl Library {
		fn open(path: &Path) -> Result<Self> {
			let c_path = path_to_cstring(path)?;

			let handle = unsafe {
				libc::dlerror();
				libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL)
			};

			if handle.is_null() {
				let reason = last_dl_error();
				error!("Failed to open {}: {}", path.display(), reason);
				return Err(PatchError::Other(format!("failed to open {}: {reason}", path.display())));
			}

			debug!("Opened native library {}", path.display());
			Ok(Self {
				handle,
				path: path.display().to_string(),
			})
		}

		fn symbol(&self, name: &str) -> Option<*mut c_void> {
			let c_name = CString::new(name).ok()?;
			let sym = unsafe {
				libc::dlerror();
				libc::dlsym(self.handle, c_name.as_ptr())
			};

			if sym.is_null() {
				warn!("Symbol {} not found in {}: {}", name, self.path, last_dl_error());
				None
			} else {
				Some(sym)
			}
		}
	}

	impl Drop for Library {
		fn drop(&mut self) {
			if unsafe { libc::dlclose(self.handle) } != 0 {
				warn!("Failed to close {}: {}", self.path, last_dl_error());
			}
		}
	}

	/// Plugin loader calling the audio engine's C API through `dlopen`
	///
	/// The engine library provides `FMOD_System_LoadPlugin` and
	/// `FMOD_System_UnloadPlugin`; the codec library provides
	/// `RegisterLogCallback`.
	pub struct DlPluginLoader {
		load_plugin: Option<LoadPluginFn>,
		unload_plugin: Option<UnloadPluginFn>,
		register_log_callback: Option<RegisterLogCallbackFn>,
		// Keep the libraries open as long as the function pointers above
		_engine: Library,
		_codec: Option<Library>,
	}

	impl std::fmt::Debug for DlPluginLoader {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("DlPluginLoader")
				.field("engine", &self._engine.path)
				.field("codec", &self._codec.as_ref().map(|lib| lib.path.as_str()))
				.field("load_plugin", &self.load_plugin.is_some())
				.field("unload_plugin", &self.unload_plugin.is_some())
				.field("register_log_callback", &self.register_log_callback.is_some())
				.finish()
		}
	}

	impl DlPluginLoader {
		/// Open the engine library and, if given, the codec library
		///
		/// Only a failure to open the engine library is an error; missing
		/// entry points degrade the matching operation.
		pub fn open(engine: &Path, codec: Option<&Path>) -> Result<Self> {
			let engine = Library::open(engine)?;

			let codec = match codec.map(Library::open).transpose() {
				Ok(codec) => codec,
				Err(e) => {
					warn!("Codec library unavailable, native logging disabled: {}", e);
					None
				},
			};

			// SAFETY: the symbols are declared with these signatures by the native side.
			let load_plugin = engine
				.symbol("FMOD_System_LoadPlugin")
				.map(|sym| unsafe { std::mem::transmute::<*mut c_void, LoadPluginFn>(sym) });
			let unload_plugin = engine
				.symbol("FMOD_System_UnloadPlugin")
				.map(|sym| unsafe { std::mem::transmute::<*mut c_void, UnloadPluginFn>(sym) });
			let register_log_callback = codec
				.as_ref()
				.and_then(|lib| lib.symbol("RegisterLogCallback"))
				.map(|sym| unsafe { std::mem::transmute::<*mut c_void, RegisterLogCallbackFn>(sym) });

			Ok(Self {
				load_plugin,
				unload_plugin,
				register_log_callback,
				_engine: engine,
				_codec: codec,
			})
		}
	}

	impl PluginLoader for DlPluginLoader {
		fn load(&self, system: SystemHandle, path: &Path, priority: u32) -> (ResultCode, PluginId) {
			let Some(load_plugin) = self.load_plugin else {
				return (ResultCode::UNAVAILABLE, PluginId(0));
			};

			let c_path = match path_to_cstring(path) {
				Ok(p) => p,
				Err(e) => {
					error!("{}", e);
					return (ResultCode::UNAVAILABLE, PluginId(0));
				},
			};

			let mut handle: c_uint = 0;
			let code = unsafe { load_plugin(system.as_ptr(), c_path.as_ptr(), &mut handle, priority) };
			(ResultCode(code), PluginId(handle))
		}

		fn unload(&self, system: SystemHandle, plugin: PluginId) -> ResultCode {
			match self.unload_plugin {
				Some(unload_plugin) => ResultCode(unsafe { unload_plugin(system.as_ptr(), plugin.0) }),
				None => ResultCode::UNAVAILABLE,
			}
		}

		fn register_log_callback(&self, callback: LogCallback) -> bool {
			match self.register_log_callback {
				Some(register) => unsafe { register(callback) },
				None => false,
			}
		}

		fn name(&self) -> &'static str {
			"DlPluginLoader"
		}
	}
}

/// Serialises tests that publish a log sink
#[cfg(test)]
pub(crate) static SINK_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
