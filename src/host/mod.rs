//! Host runtime abstraction
//!
//! The interception engine never touches the host binary directly. It goes
//! through a [`HostRuntime`], which enumerates methods, installs wrappers
//! or replacement instruction bodies, and removes them again by token.

mod table;

pub use table::{Evaluator, MethodBody, MethodTable};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::call::{MethodSig, TargetDescriptor};
use crate::core::rewrite::Instruction;
use crate::patcher::{Result, Wrapper};

/// Counter for generating unique install tokens
static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of a method inside one host runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

/// A resolved, invocable method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodHandle {
	pub id: MethodId,
	pub sig: Arc<MethodSig>,
}

impl fmt::Display for MethodHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} [#{}]", self.sig, self.id.0)
	}
}

/// Handle returned by the host for one installed modification
///
/// Tokens are not `Clone`: removing a modification consumes its token.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct InstallToken(u64);

impl InstallToken {
	/// Generate a new unique token
	#[must_use]
	pub fn next() -> Self {
		Self(TOKEN_COUNTER.fetch_add(1, Ordering::SeqCst))
	}

	#[must_use]
	pub const fn id(&self) -> u64 {
		self.0
	}
}

/// Introspection and hooking capability of the host
pub trait HostRuntime: Send + Sync {
	/// List every method declared on `target.owner` under `target.name`
	///
	/// Overload filtering is left to the caller.
	fn lookup(&self, target: &TargetDescriptor) -> Vec<MethodHandle>;

	/// Wrap a method so calls run through `wrapper`
	fn install_wrapper(&self, method: &MethodHandle, wrapper: Arc<Wrapper>) -> Result<InstallToken>;

	/// Current instruction body of a method, if the host exposes one
	fn method_body(&self, method: &MethodHandle) -> Option<Vec<Instruction>>;

	/// Replace the instruction body of a method
	fn replace_body(&self, method: &MethodHandle, body: Vec<Instruction>) -> Result<InstallToken>;

	/// Undo one installed modification
	fn remove(&self, token: InstallToken) -> Result<()>;

	/// Get the name of the runtime
	///
	/// This is used for debugging and logging purposes.
	fn name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}
}
