//! Method identities
//!
//! A [`MethodSig`] names one concrete method of the host binary. A
//! [`TargetDescriptor`] is the selector a patch unit uses to find it, and
//! may leave the parameter list open when the method has no overloads.

use std::fmt;

/// A parameter type signature, compared by its textual form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeSig(pub String);

impl TypeSig {
	#[must_use]
	pub fn new(name: impl Into<String>) -> Self {
		Self(name.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for TypeSig {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

impl From<String> for TypeSig {
	fn from(s: String) -> Self {
		Self(s)
	}
}

impl fmt::Display for TypeSig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Name of a method, or the constructor of its owning type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodName {
	/// An ordinary named method
	Named(String),
	/// The instance constructor
	Constructor,
}

impl fmt::Display for MethodName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Named(name) => f.write_str(name),
			Self::Constructor => f.write_str(".ctor"),
		}
	}
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[TypeSig]) -> fmt::Result {
	f.write_str("(")?;
	for (i, param) in params.iter().enumerate() {
		if i > 0 {
			f.write_str(", ")?;
		}
		write!(f, "{param}")?;
	}
	f.write_str(")")
}

/// Fully specified identity of one method
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodSig {
	/// Declaring type or module
	pub owner: String,
	/// Method name
	pub name: MethodName,
	/// Ordered parameter types
	pub params: Vec<TypeSig>,
}

impl MethodSig {
	/// Create a signature for a named method
	pub fn new<P, T>(owner: impl Into<String>, name: impl Into<String>, params: P) -> Self
	where
		P: IntoIterator<Item = T>,
		T: Into<TypeSig>,
	{
		Self {
			owner: owner.into(),
			name: MethodName::Named(name.into()),
			params: params.into_iter().map(Into::into).collect(),
		}
	}

	/// Create a signature for a constructor
	pub fn constructor<P, T>(owner: impl Into<String>, params: P) -> Self
	where
		P: IntoIterator<Item = T>,
		T: Into<TypeSig>,
	{
		Self {
			owner: owner.into(),
			name: MethodName::Constructor,
			params: params.into_iter().map(Into::into).collect(),
		}
	}
}

impl fmt::Display for MethodSig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}::{}", self.owner, self.name)?;
		write_params(f, &self.params)
	}
}

/// Selector for a method to intercept
///
/// When `params` is `None` any overload with the right name matches, so the
/// selector only resolves if the name is unique on its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
	/// Declaring type or module
	pub owner: String,
	/// Method name
	pub name: MethodName,
	/// Exact parameter list, if the selector pins one
	pub params: Option<Vec<TypeSig>>,
}

impl TargetDescriptor {
	/// Select a method by owner and name only
	pub fn method(owner: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			owner: owner.into(),
			name: MethodName::Named(name.into()),
			params: None,
		}
	}

	/// Select the constructor with exactly these parameter types
	pub fn constructor<P, T>(owner: impl Into<String>, params: P) -> Self
	where
		P: IntoIterator<Item = T>,
		T: Into<TypeSig>,
	{
		Self {
			owner: owner.into(),
			name: MethodName::Constructor,
			params: Some(params.into_iter().map(Into::into).collect()),
		}
	}

	/// Pin the parameter list
	#[must_use]
	pub fn with_params<P, T>(mut self, params: P) -> Self
	where
		P: IntoIterator<Item = T>,
		T: Into<TypeSig>,
	{
		self.params = Some(params.into_iter().map(Into::into).collect());
		self
	}

	/// Check whether a concrete method satisfies this selector
	#[must_use]
	pub fn matches(&self, sig: &MethodSig) -> bool {
		if self.owner != sig.owner || self.name != sig.name {
			return false;
		}

		match &self.params {
			Some(params) => *params == sig.params,
			None => true,
		}
	}
}

impl fmt::Display for TargetDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}::{}", self.owner, self.name)?;
		match &self.params {
			Some(params) => write_params(f, params),
			None => f.write_str("(..)"),
		}
	}
}
