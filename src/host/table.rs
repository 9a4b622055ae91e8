//! In-process method table
//!
//! `MethodTable` is a [`HostRuntime`] whose methods are Rust closures,
//! optionally backed by an instruction body and an evaluator for it. Calls
//! made through [`MethodTable::invoke`] run through every installed wrapper
//! (last installed outermost) and use the most recent replacement body.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use super::{HostRuntime, InstallToken, MethodHandle, MethodId};
use crate::call::{Args, CallContext, MethodSig, TargetDescriptor, Value};
use crate::core::rewrite::Instruction;
use crate::patcher::{PatchError, Result, Wrapper};

/// Body of a natively implemented method
pub type MethodBody = Arc<dyn Fn(&mut CallContext) + Send + Sync>;

/// Executes an instruction body against a call context
pub type Evaluator = Arc<dyn Fn(&[Instruction], &mut CallContext) + Send + Sync>;

enum Implementation {
	Native(MethodBody),
	Il { body: Vec<Instruction>, eval: Evaluator },
}

struct MethodEntry {
	handle: MethodHandle,
	implementation: Implementation,
	/// Stack of replacement bodies, the last one is active
	replaced: Vec<(u64, Vec<Instruction>)>,
	/// Installed wrappers, the last one is outermost
	wrappers: Vec<(u64, Arc<Wrapper>)>,
}

impl MethodEntry {
	fn active_body(&self) -> Option<&[Instruction]> {
		match &self.implementation {
			Implementation::Native(_) => None,
			Implementation::Il { body, .. } => Some(
				self.replaced
					.last()
					.map_or(body.as_slice(), |(_, replacement)| replacement.as_slice()),
			),
		}
	}
}

enum Base {
	Native(MethodBody),
	Il(Vec<Instruction>, Evaluator),
}

impl Base {
	fn run(&self, ctx: &mut CallContext) {
		match self {
			Self::Native(body) => body(ctx),
			Self::Il(body, eval) => eval(body, ctx),
		}
	}
}

fn run_chain(wrappers: &[Arc<Wrapper>], ctx: &mut CallContext, base: &Base) {
	match wrappers.split_last() {
		None => base.run(ctx),
		Some((outer, inner)) => outer.call(ctx, &mut |ctx| run_chain(inner, ctx, base)),
	}
}

/// Host runtime backed by an in-process table of methods
#[derive(Default)]
pub struct MethodTable {
	methods: RwLock<Vec<MethodEntry>>,
	next_id: AtomicU64,
}

impl std::fmt::Debug for MethodTable {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
		f.debug_struct("MethodTable")
			.field("methods", &methods.len())
			.finish()
	}
}

impl MethodTable {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn insert(&self, sig: MethodSig, implementation: Implementation) -> MethodHandle {
		let handle = MethodHandle {
			id: MethodId(self.next_id.fetch_add(1, Ordering::SeqCst)),
			sig: Arc::new(sig),
		};

		debug!("Defined method {}", handle);

		self.methods
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(MethodEntry {
				handle: handle.clone(),
				implementation,
				replaced: Vec::new(),
				wrappers: Vec::new(),
			});

		handle
	}

	/// Define a method implemented by a closure
	pub fn define<F>(&self, sig: MethodSig, body: F) -> MethodHandle
	where
		F: Fn(&mut CallContext) + Send + Sync + 'static,
	{
		self.insert(sig, Implementation::Native(Arc::new(body)))
	}

	/// Define a method with an instruction body run by `eval`
	pub fn define_il<F>(&self, sig: MethodSig, body: Vec<Instruction>, eval: F) -> MethodHandle
	where
		F: Fn(&[Instruction], &mut CallContext) + Send + Sync + 'static,
	{
		self.insert(sig, Implementation::Il {
			body,
			eval: Arc::new(eval),
		})
	}

	/// Find a defined method by its exact signature
	#[must_use]
	pub fn find(&self, sig: &MethodSig) -> Option<MethodHandle> {
		let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
		methods
			.iter()
			.find(|entry| *entry.handle.sig == *sig)
			.map(|entry| entry.handle.clone())
	}

	/// Call a method the way the host would
	///
	/// Returns the final call context, or `None` if the method is unknown.
	pub fn invoke(&self, method: &MethodHandle, instance: Option<Value>, args: Args) -> Option<CallContext> {
		// Snapshot under the lock so wrappers may re-enter the table
		let (wrappers, base) = {
			let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
			let entry = methods.iter().find(|entry| entry.handle.id == method.id)?;

			let wrappers: Vec<Arc<Wrapper>> = entry.wrappers.iter().map(|(_, w)| Arc::clone(w)).collect();
			let base = match &entry.implementation {
				Implementation::Native(body) => Base::Native(Arc::clone(body)),
				Implementation::Il { eval, .. } => {
					Base::Il(entry.active_body().unwrap_or_default().to_vec(), Arc::clone(eval))
				},
			};
			(wrappers, base)
		};

		trace!("Invoking {} through {} wrappers", method, wrappers.len());

		let mut ctx = CallContext::new(Arc::clone(&method.sig), instance, args);
		run_chain(&wrappers, &mut ctx, &base);
		Some(ctx)
	}

	/// Check whether a method currently carries any modification
	#[must_use]
	pub fn is_modified(&self, method: &MethodHandle) -> bool {
		let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
		methods
			.iter()
			.find(|entry| entry.handle.id == method.id)
			.is_some_and(|entry| !entry.wrappers.is_empty() || !entry.replaced.is_empty())
	}

	/// Number of wrappers installed on a method
	#[must_use]
	pub fn wrapper_count(&self, method: &MethodHandle) -> usize {
		let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
		methods
			.iter()
			.find(|entry| entry.handle.id == method.id)
			.map_or(0, |entry| entry.wrappers.len())
	}
}

impl HostRuntime for MethodTable {
	fn lookup(&self, target: &TargetDescriptor) -> Vec<MethodHandle> {
		let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
		methods
			.iter()
			.filter(|entry| entry.handle.sig.owner == target.owner && entry.handle.sig.name == target.name)
			.map(|entry| entry.handle.clone())
			.collect()
	}

	fn install_wrapper(&self, method: &MethodHandle, wrapper: Arc<Wrapper>) -> Result<InstallToken> {
		let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
		let entry = methods
			.iter_mut()
			.find(|entry| entry.handle.id == method.id)
			.ok_or_else(|| PatchError::Host(format!("unknown method {method}")))?;

		let token = InstallToken::next();
		entry.wrappers.push((token.id(), wrapper));
		debug!("Installed wrapper #{} on {}", token.id(), method);
		Ok(token)
	}

	fn method_body(&self, method: &MethodHandle) -> Option<Vec<Instruction>> {
		let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
		methods
			.iter()
			.find(|entry| entry.handle.id == method.id)
			.and_then(MethodEntry::active_body)
			.map(<[Instruction]>::to_vec)
	}

	fn replace_body(&self, method: &MethodHandle, body: Vec<Instruction>) -> Result<InstallToken> {
		let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
		let entry = methods
			.iter_mut()
			.find(|entry| entry.handle.id == method.id)
			.ok_or_else(|| PatchError::Host(format!("unknown method {method}")))?;

		if matches!(entry.implementation, Implementation::Native(_)) {
			return Err(PatchError::Host(format!("{method} has no instruction body")));
		}

		let token = InstallToken::next();
		entry.replaced.push((token.id(), body));
		debug!("Replaced body of {} (#{})", method, token.id());
		Ok(token)
	}

	fn remove(&self, token: InstallToken) -> Result<()> {
		let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
		for entry in methods.iter_mut() {
			if let Some(pos) = entry.wrappers.iter().position(|(id, _)| *id == token.id()) {
				entry.wrappers.remove(pos);
				debug!("Removed wrapper #{} from {}", token.id(), entry.handle);
				return Ok(());
			}
			if let Some(pos) = entry.replaced.iter().position(|(id, _)| *id == token.id()) {
				entry.replaced.remove(pos);
				debug!("Restored body of {} (#{})", entry.handle, token.id());
				return Ok(());
			}
		}

		Err(PatchError::Host(format!("unknown install token #{}", token.id())))
	}

	fn name(&self) -> &'static str {
		"MethodTable"
	}
}
