//! Integration tests for patchwork
//!
//! These drive a `Patcher` against the in-process `MethodTable` host and a
//! recording plugin loader, the way a host application would.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use patchwork_rs::ffi::LogCallback;
use patchwork_rs::patcher::Wrapper;
use patchwork_rs::{
	CallContext, CallRedirect, CallbackInit, Flow, HostRuntime, InstallToken, Instruction, LifecycleState, MethodHandle,
	MethodSig, MethodTable, NativeHandleRegistry, OpCode, Operand, PatchError, PatchUnit, PluginAttach, PluginId,
	PluginLoader, ResultCode, SystemHandle, TargetDescriptor, Value,
};

#[derive(Debug, Default)]
struct LoaderLog {
	loads: Vec<(SystemHandle, PathBuf, u32)>,
	unloads: Vec<(SystemHandle, PluginId)>,
	registrations: usize,
	clears: usize,
}

#[derive(Debug, Default)]
struct RecordingLoader {
	log: Mutex<LoaderLog>,
	next_id: AtomicUsize,
	reject_callback: bool,
	reject_loads: bool,
}

impl RecordingLoader {
	fn native_calls(&self) -> usize {
		let log = self.log.lock().unwrap();
		log.loads.len() + log.unloads.len() + log.registrations + log.clears
	}
}

impl PluginLoader for RecordingLoader {
	fn load(&self, system: SystemHandle, path: &Path, priority: u32) -> (ResultCode, PluginId) {
		self.log.lock().unwrap().loads.push((system, path.to_path_buf(), priority));
		if self.reject_loads {
			return (ResultCode(23), PluginId(0));
		}
		let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u32 + 1;
		(ResultCode::OK, PluginId(id))
	}

	fn unload(&self, system: SystemHandle, plugin: PluginId) -> ResultCode {
		self.log.lock().unwrap().unloads.push((system, plugin));
		ResultCode::OK
	}

	fn register_log_callback(&self, _callback: LogCallback) -> bool {
		self.log.lock().unwrap().registrations += 1;
		!self.reject_callback
	}

	fn clear_log_callback(&self) {
		self.log.lock().unwrap().clears += 1;
	}
}

fn ansi() -> MethodSig {
	MethodSig::new("Marshal", "PtrToStringAnsi", ["IntPtr", "int"])
}

fn unicode() -> MethodSig {
	MethodSig::new("Marshal", "PtrToStringUni", ["IntPtr", "int"])
}

/// Evaluator that reports which decoder the body calls
fn decode_eval(body: &[Instruction], ctx: &mut CallContext) {
	for instr in body {
		if instr.opcode == OpCode::Call {
			if let Operand::Method(method) = &instr.operand {
				ctx.result = Some(Value::Str(method.name.to_string()));
			}
		}
	}
}

fn tag_reader_body() -> Vec<Instruction> {
	vec![
		Instruction::new(OpCode::Ldarg, Operand::Slot(0)),
		Instruction::new(OpCode::Ldarg, Operand::Slot(1)),
		Instruction::call(ansi()),
		Instruction::new(OpCode::Stloc, Operand::Slot(0)),
		Instruction::simple(OpCode::Ret),
	]
}

struct Host {
	table: Arc<MethodTable>,
	scroll: patchwork_rs::MethodHandle,
	tags: patchwork_rs::MethodHandle,
	audio_ctor: patchwork_rs::MethodHandle,
}

fn audio_ctor_sig() -> MethodSig {
	MethodSig::constructor("AudioSystem", ["IntPtr", "int", "int", "bool"])
}

fn host() -> Host {
	let table = Arc::new(MethodTable::new());
	let scroll = table.define(MethodSig::new("ScrollView", "OnScroll", ["float"]), |ctx| {
		ctx.result = ctx.args.get(0).cloned();
	});
	let tags = table.define_il(MethodSig::new("TagReader", "ReadTag", ["IntPtr", "int"]), tag_reader_body(), decode_eval);
	let audio_ctor = table.define(audio_ctor_sig(), |_| {});
	// Overload that a bare name selector cannot tell apart
	table.define(MethodSig::constructor("AudioSystem", Vec::<&str>::new()), |_| {});

	Host {
		table,
		scroll,
		tags,
		audio_ctor,
	}
}

#[patchwork_rs::pre_stage]
fn triple_scroll(ctx: &mut CallContext) -> Flow {
	let delta = match ctx.args.get(0) {
		Some(Value::Float(delta)) => *delta,
		_ => return Flow::Continue,
	};
	Flow::Modify([delta * 3.0].into_iter().collect())
}

#[patchwork_rs::post_stage]
fn clamp_scroll(ctx: &mut CallContext) {
	if let Some(Value::Float(v)) = ctx.result {
		ctx.result = Some(Value::Float(v.min(10.0)));
	}
}

fn scroll_unit() -> PatchUnit {
	PatchUnit::builder("scroll", TargetDescriptor::method("ScrollView", "OnScroll"))
		.pre(TripleScroll)
		.post(ClampScroll)
		.build()
}

fn decode_unit() -> PatchUnit {
	PatchUnit::builder("tag-decoding", TargetDescriptor::method("TagReader", "ReadTag"))
		.rewriter(CallRedirect::new(ansi(), unicode()).unwrap())
		.build()
}

fn codec_unit(registry: &Arc<NativeHandleRegistry>) -> PatchUnit {
	let target = TargetDescriptor::constructor("AudioSystem", ["IntPtr", "int", "int", "bool"]);
	PatchUnit::builder("codec", target)
		.post(PluginAttach::new(Arc::clone(registry), |ctx: &CallContext| {
			ctx.instance.as_ref().and_then(Value::as_handle).map(SystemHandle)
		}))
		.init(CallbackInit::new(Arc::clone(registry)))
		.build()
}

fn scroll(host: &Host, delta: f64) -> Option<Value> {
	host.table
		.invoke(&host.scroll, None, [delta].into_iter().collect())
		.and_then(|ctx| ctx.result)
}

fn read_tag(host: &Host) -> Option<Value> {
	host.table
		.invoke(&host.tags, None, [0i64, 4].into_iter().collect())
		.and_then(|ctx| ctx.result)
}

fn construct_audio(host: &Host, handle: usize) {
	host.table
		.invoke(&host.audio_ctor, Some(Value::Handle(handle)), [0i64, 1, 2, 0].into_iter().collect())
		.unwrap();
}

#[test]
fn invalid_target_does_not_block_valid_unit() {
	let host = host();
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.unit(PatchUnit::builder("missing", TargetDescriptor::method("ScrollView", "OnZoom")).build())
		.unit(scroll_unit())
		.build()
		.unwrap();

	let report = patcher.enable();
	assert!(patcher.toggle(true));
	assert_eq!(report.installed, vec!["scroll".to_string()]);
	assert!(matches!(report.failure("missing"), Some(PatchError::TargetNotFound(_))));
	assert_eq!(scroll(&host, 2.0), Some(Value::Float(6.0)));
	assert_eq!(scroll(&host, 5.0), Some(Value::Float(10.0)));
}

#[test]
fn ambiguous_constructor_selector_is_reported() {
	let host = host();
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.unit(
			PatchUnit::builder("any-ctor", TargetDescriptor {
				owner: "AudioSystem".into(),
				name: patchwork_rs::MethodName::Constructor,
				params: None,
			})
			.post(|_: &mut CallContext| {})
			.build(),
		)
		.build()
		.unwrap();

	let report = patcher.enable();
	assert!(matches!(
		report.failure("any-ctor"),
		Some(PatchError::AmbiguousTarget { count: 2, .. })
	));
	assert!(report.installed.is_empty());
}

#[test]
fn rewrite_swaps_decoder_until_disabled() {
	let host = host();
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.unit(decode_unit())
		.build()
		.unwrap();

	assert_eq!(read_tag(&host), Some(Value::Str("PtrToStringAnsi".into())));

	let report = patcher.enable();
	assert!(report.is_clean());
	assert_eq!(read_tag(&host), Some(Value::Str("PtrToStringUni".into())));

	patcher.disable();
	assert_eq!(read_tag(&host), Some(Value::Str("PtrToStringAnsi".into())));
	assert!(!host.table.is_modified(&host.tags));
}

#[test]
fn disable_restores_original_behavior_and_is_idempotent() {
	let host = host();
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.unit(scroll_unit())
		.build()
		.unwrap();

	let before = scroll(&host, 4.0);
	patcher.enable();
	assert_ne!(scroll(&host, 4.0), before);

	patcher.disable();
	let after_one = scroll(&host, 4.0);
	patcher.disable();
	assert_eq!(scroll(&host, 4.0), after_one);
	assert_eq!(after_one, before);
	assert_eq!(host.table.wrapper_count(&host.scroll), 0);
}

#[test]
fn reenable_reproduces_installed_set() {
	let host = host();
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.unit(scroll_unit())
		.unit(decode_unit())
		.unit(PatchUnit::builder("missing", TargetDescriptor::method("Nope", "Nope")).build())
		.build()
		.unwrap();

	let first = patcher.enable();
	let first_set = patcher.engine().installed_units();
	patcher.disable();
	let second = patcher.enable();

	assert_eq!(first.installed, second.installed);
	assert_eq!(patcher.engine().installed_units(), first_set);
	assert_eq!(host.table.wrapper_count(&host.scroll), 1);
	assert_eq!(scroll(&host, 1.0), Some(Value::Float(3.0)));
}

#[test]
fn codec_attaches_to_each_constructed_system() {
	let host = host();
	let loader = Arc::new(RecordingLoader::default());
	let builder = patchwork_rs::new()
		.init_logging(false)
		.mod_dir("/opt/mods/codec")
		.host(Arc::clone(&host.table))
		.native_loader(Arc::clone(&loader));
	let registry = builder.registry().unwrap();
	let mut patcher = builder.unit(codec_unit(&registry)).build().unwrap();

	patcher.enable();
	assert!(registry.has_callback());

	construct_audio(&host, 0x1000);
	construct_audio(&host, 0x2000);
	construct_audio(&host, 0x1000);
	construct_audio(&host, 0);
	assert_eq!(registry.len(), 2);

	{
		let log = loader.log.lock().unwrap();
		assert_eq!(log.loads.len(), 2);
		let (_, path, priority) = &log.loads[0];
		assert!(path.starts_with("/opt/mods/codec"));
		assert_eq!(*priority, 2600);
	}

	patcher.disable();
	assert!(registry.is_empty());
	assert!(!registry.has_callback());

	let log = loader.log.lock().unwrap();
	let mut unloaded: Vec<SystemHandle> = log.unloads.iter().map(|(system, _)| *system).collect();
	unloaded.sort();
	assert_eq!(unloaded, vec![SystemHandle(0x1000), SystemHandle(0x2000)]);
	assert_eq!(log.registrations, 1);
	assert_eq!(log.clears, 1);
}

#[test]
fn two_systems_unload_twice() {
	let loader = Arc::new(RecordingLoader::default());
	let registry = NativeHandleRegistry::new(Arc::clone(&loader) as Arc<dyn PluginLoader>, "codec.so", 2600);

	let a = registry.load_plugin(SystemHandle(0xA)).unwrap();
	let b = registry.load_plugin(SystemHandle(0xB)).unwrap();
	assert_ne!(a.plugin, b.plugin);

	assert_eq!(registry.unload_all(), 2);
	assert!(registry.is_empty());

	let log = loader.log.lock().unwrap();
	assert_eq!(log.unloads.len(), 2);
	assert!(log.unloads.contains(&(SystemHandle(0xA), a.plugin)));
	assert!(log.unloads.contains(&(SystemHandle(0xB), b.plugin)));
}

#[test]
fn disable_on_empty_patcher_makes_no_native_calls() {
	let host = host();
	let loader = Arc::new(RecordingLoader::default());
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.native_loader(Arc::clone(&loader))
		.build()
		.unwrap();

	patcher.disable();
	patcher.disable();
	assert_eq!(loader.native_calls(), 0);
	assert!(patcher.engine().installed_units().is_empty());
}

#[test]
fn callback_failure_degrades_only_diagnostics() {
	let host = host();
	let loader = Arc::new(RecordingLoader {
		reject_callback: true,
		..RecordingLoader::default()
	});
	let builder = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.native_loader(Arc::clone(&loader));
	let registry = builder.registry().unwrap();
	let mut patcher = builder.unit(codec_unit(&registry)).build().unwrap();

	let report = patcher.enable();
	assert_eq!(report.installed, vec!["codec".to_string()]);
	assert!(!registry.has_callback());

	construct_audio(&host, 0x42);
	assert_eq!(registry.len(), 1);

	patcher.disable();
	let log = loader.log.lock().unwrap();
	assert_eq!(log.unloads.len(), 1);
	assert_eq!(log.clears, 0);
}

#[test]
fn failed_load_still_releases_callback_once() {
	let loader = Arc::new(RecordingLoader {
		reject_loads: true,
		..RecordingLoader::default()
	});
	let registry = NativeHandleRegistry::new(Arc::clone(&loader) as Arc<dyn PluginLoader>, "codec.so", 2600);

	registry.register_callback().unwrap();
	assert!(matches!(
		registry.load_plugin(SystemHandle(0x7)),
		Err(PatchError::NativeLoadFailure { code: ResultCode(23) })
	));

	registry.unload_all();
	registry.unload_all();

	let log = loader.log.lock().unwrap();
	assert_eq!(log.clears, 1);
	assert!(log.unloads.is_empty());
}

#[test]
fn concurrent_loads_are_balanced() {
	let loader = Arc::new(RecordingLoader::default());
	let registry = Arc::new(NativeHandleRegistry::new(
		Arc::clone(&loader) as Arc<dyn PluginLoader>,
		"codec.so",
		2600,
	));

	let workers: Vec<_> = (1..=8usize)
		.map(|i| {
			let registry = Arc::clone(&registry);
			thread::spawn(move || {
				for j in 0..4usize {
					let _ = registry.load_plugin(SystemHandle(i * 0x100 + j % 2));
				}
			})
		})
		.collect();
	for worker in workers {
		worker.join().unwrap();
	}

	assert_eq!(registry.len(), 16);
	assert_eq!(registry.unload_all(), 16);

	let log = loader.log.lock().unwrap();
	assert_eq!(log.loads.len(), 16);
	assert_eq!(log.unloads.len(), 16);
}

#[test]
fn declined_preparation_skips_unit() {
	let host = host();
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.unit(
			PatchUnit::builder("needs-settings", TargetDescriptor::method("ScrollView", "OnScroll"))
				.prepare(patchwork_rs::NeverApply::new("settings object not found"))
				.pre(TripleScroll)
				.build(),
		)
		.build()
		.unwrap();

	let report = patcher.enable();
	assert_eq!(report.skipped, vec![(
		"needs-settings".to_string(),
		"settings object not found".to_string()
	)]);
	assert_eq!(scroll(&host, 2.0), Some(Value::Float(2.0)));
}

#[test]
fn trace_calls_wraps_rewrite_only_unit() {
	let host = host();
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.trace_calls(true)
		.host(Arc::clone(&host.table))
		.unit(decode_unit())
		.build()
		.unwrap();

	assert!(patcher.enable().is_clean());
	assert_eq!(host.table.wrapper_count(&host.tags), 1);
	assert_eq!(read_tag(&host), Some(Value::Str("PtrToStringUni".into())));

	patcher.disable();
	assert_eq!(host.table.wrapper_count(&host.tags), 0);
	assert!(!host.table.is_modified(&host.tags));
	assert_eq!(read_tag(&host), Some(Value::Str("PtrToStringAnsi".into())));
}

#[test]
fn external_registry_loads_its_own_plugin() {
	let host = host();
	let loader = Arc::new(RecordingLoader::default());
	let registry = Arc::new(NativeHandleRegistry::new(
		Arc::clone(&loader) as Arc<dyn PluginLoader>,
		"/srv/codecs/custom_codec.so",
		9,
	));
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&host.table))
		.with_registry(Arc::clone(&registry))
		.unit(codec_unit(&registry))
		.build()
		.unwrap();

	patcher.enable();
	construct_audio(&host, 0x3000);
	{
		let log = loader.log.lock().unwrap();
		assert_eq!(log.loads, vec![(SystemHandle(0x3000), PathBuf::from("/srv/codecs/custom_codec.so"), 9)]);
	}

	patcher.disable();
	assert!(registry.is_empty());
	assert_eq!(loader.log.lock().unwrap().unloads.len(), 1);
}

/// Host whose metadata for one type is unreadable and whose removals can fail hard
struct CrashingHost {
	table: Arc<MethodTable>,
	crash_on_remove: AtomicBool,
}

impl HostRuntime for CrashingHost {
	fn lookup(&self, target: &TargetDescriptor) -> Vec<MethodHandle> {
		assert!(target.owner != "Corrupt", "cannot read metadata of {target}");
		self.table.lookup(target)
	}

	fn install_wrapper(&self, method: &MethodHandle, wrapper: Arc<Wrapper>) -> Result<InstallToken, PatchError> {
		self.table.install_wrapper(method, wrapper)
	}

	fn method_body(&self, method: &MethodHandle) -> Option<Vec<Instruction>> {
		self.table.method_body(method)
	}

	fn replace_body(&self, method: &MethodHandle, body: Vec<Instruction>) -> Result<InstallToken, PatchError> {
		self.table.replace_body(method, body)
	}

	fn remove(&self, token: InstallToken) -> Result<(), PatchError> {
		assert!(!self.crash_on_remove.load(Ordering::SeqCst), "host unloaded while removing {}", token.id());
		self.table.remove(token)
	}
}

#[test]
fn host_panics_stay_inside_enable_and_disable() {
	let host = host();
	let crashing = Arc::new(CrashingHost {
		table: Arc::clone(&host.table),
		crash_on_remove: AtomicBool::new(false),
	});
	let mut patcher = patchwork_rs::new()
		.init_logging(false)
		.host(Arc::clone(&crashing))
		.unit(PatchUnit::builder("corrupt", TargetDescriptor::method("Corrupt", "Anything")).build())
		.unit(scroll_unit())
		.build()
		.unwrap();

	assert!(patcher.toggle(true));
	assert_eq!(scroll(&host, 2.0), Some(Value::Float(6.0)));
	assert_eq!(patcher.engine().installed_units(), vec!["scroll".to_string()]);

	crashing.crash_on_remove.store(true, Ordering::SeqCst);
	assert!(patcher.toggle(false));
	assert_eq!(patcher.state(), LifecycleState::Disabled);
	assert!(patcher.engine().installed_units().is_empty());
}
