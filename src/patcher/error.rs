//! Error types for the patcher
//!
//! This module contains error types and a result type for the patcher.

use thiserror::Error;

use crate::ffi::ResultCode;

/// Result type for patcher operations
pub type Result<T> = std::result::Result<T, PatchError>;

/// Error type for patcher operations
#[derive(Debug, Error)]
pub enum PatchError {
	/// No method matched the target selector
	#[error("Target not found: {0}")]
	TargetNotFound(String),

	/// More than one method matched the target selector
	#[error("Ambiguous target {target}: {count} methods match")]
	AmbiguousTarget { target: String, count: usize },

	/// The unit's preparation check declined to install
	#[error("Preparation declined: {0}")]
	PreparationDeclined(String),

	/// The rewriter found no matching call site
	#[error("Rewrite not applied to {0}")]
	RewriteNotApplied(String),

	/// The native side refused to load the plugin
	#[error("Failed to load native plugin: {code}")]
	NativeLoadFailure { code: ResultCode },

	/// The native side refused to unload the plugin
	#[error("Failed to unload native plugin: {code}")]
	NativeUnloadFailure { code: ResultCode },

	/// The native system instance has no live handle
	#[error("Native system instance has no valid handle")]
	InvalidSystemHandle,

	/// The native log callback could not be installed
	#[error("Failed to register native log callback")]
	CallbackRegistrationFailure,

	/// A call redirect pairs two methods with different parameter lists
	#[error("Incompatible call redirect from {from} to {to}")]
	IncompatibleRedirect { from: String, to: String },

	/// An argument index was out of range
	#[error("Argument index {index} out of range for {len} arguments")]
	InvalidArgumentIndex { index: usize, len: usize },

	/// Two patch units were registered under the same name
	#[error("A patch unit named {0} is already registered")]
	AlreadyRegistered(String),

	/// The host runtime failed to install or remove a modification
	#[error("Host runtime error: {0}")]
	Host(String),

	/// Other error
	#[error("{0}")]
	Other(String),
}

impl PatchError {
	/// Whether this error is one of the locally recovered kinds
	///
	/// Degradations are logged and the patcher continues; everything else
	/// indicates misuse of the builder or the collaborators.
	#[must_use]
	pub const fn is_degradation(&self) -> bool {
		matches!(
			self,
			Self::TargetNotFound(_)
				| Self::AmbiguousTarget { .. }
				| Self::PreparationDeclined(_)
				| Self::RewriteNotApplied(_)
				| Self::NativeLoadFailure { .. }
				| Self::NativeUnloadFailure { .. }
				| Self::InvalidSystemHandle
				| Self::CallbackRegistrationFailure
				| Self::Host(_)
		)
	}
}

impl From<&str> for PatchError {
	fn from(s: &str) -> Self {
		Self::Other(s.to_string())
	}
}

impl From<String> for PatchError {
	fn from(s: String) -> Self {
		Self::Other(s)
	}
}
