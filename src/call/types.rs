//! Types for working with intercepted calls
//!
//! This module contains the core types used to represent a call to a
//! wrapped method, its arguments, and the verdict a pre-stage returns.

use std::sync::Arc;

use crate::call::MethodSig;
use crate::patcher::{PatchError, Result};

/// A host value crossing the wrapper boundary
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
	/// No value, or a null reference
	#[default]
	Null,
	Bool(bool),
	Int(i64),
	UInt(u64),
	Float(f64),
	Str(String),
	Array(Vec<Value>),
	/// Opaque host object or native pointer
	Handle(usize),
}

impl Value {
	#[must_use]
	pub const fn as_int(&self) -> Option<i64> {
		match self {
			Self::Int(v) => Some(*v),
			_ => None,
		}
	}

	#[must_use]
	pub const fn as_handle(&self) -> Option<usize> {
		match self {
			Self::Handle(v) => Some(*v),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::Str(s) => Some(s),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_array(&self) -> Option<&[Value]> {
		match self {
			Self::Array(items) => Some(items),
			_ => None,
		}
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Self::Bool(v)
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<i32> for Value {
	fn from(v: i32) -> Self {
		Self::Int(v.into())
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Self::Float(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Self::Str(v.to_string())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Self::Str(v)
	}
}

/// Ordered arguments of a call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args(Vec<Value>);

impl Args {
	/// Create a new `Args` from individual values
	#[must_use]
	pub const fn new(values: Vec<Value>) -> Self {
		Self(values)
	}

	/// Get a specific argument by index
	#[must_use]
	pub fn get(&self, index: usize) -> Option<&Value> {
		self.0.get(index)
	}

	pub fn get_mut(&mut self, index: usize) -> Option<&mut Value> {
		self.0.get_mut(index)
	}

	/// Set a specific argument by index
	pub fn set(&mut self, index: usize, value: Value) -> Result<()> {
		let len = self.0.len();
		match self.0.get_mut(index) {
			Some(slot) => {
				*slot = value;
				Ok(())
			},
			None => Err(PatchError::InvalidArgumentIndex { index, len }),
		}
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Value> {
		self.0.iter()
	}

	#[must_use]
	pub fn into_inner(self) -> Vec<Value> {
		self.0
	}
}

impl<T: Into<Value>> FromIterator<T> for Args {
	fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
		Self(iter.into_iter().map(Into::into).collect())
	}
}

/// Context for one call to a wrapped method
///
/// The same context flows through the pre-stage, the original body and the
/// post-stage, so every step observes the latest arguments and result.
#[derive(Debug, Clone)]
pub struct CallContext {
	/// The method being called
	pub target: Arc<MethodSig>,
	/// Receiver of the call, `None` for static methods
	pub instance: Option<Value>,
	/// Arguments, including by-reference outputs
	pub args: Args,
	/// Return value, set by the original body or by a skipping pre-stage
	pub result: Option<Value>,
	/// Whether the original body was skipped
	pub skipped: bool,
}

impl CallContext {
	#[must_use]
	pub const fn new(target: Arc<MethodSig>, instance: Option<Value>, args: Args) -> Self {
		Self {
			target,
			instance,
			args,
			result: None,
			skipped: false,
		}
	}
}

/// Action to take after a pre-stage ran
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
	/// Run the original body with the current arguments
	Continue,
	/// Replace the arguments and run the original body
	Modify(Args),
	/// Do not run the original body, keep whatever result the stage set
	Skip,
	/// Do not run the original body and return the given value
	Return(Value),
}
