//! Instruction-level rewriting
//!
//! When wrapping a method is not enough, a patch unit can rewrite the
//! method's instruction body instead. Bodies are plain ordered sequences of
//! [`Instruction`]s. A rewrite pass is pure: it takes a body and returns a
//! new one together with whether anything changed.
//!
//! The stock pass, [`CallRedirect`], retargets every direct call to one
//! known method so it calls another method of the same shape. Call sites
//! are matched by the callee's declaring type, name and parameter list,
//! never by position.

use std::fmt;

use tracing::{debug, trace};

use crate::call::MethodSig;
use crate::patcher::{PatchError, Result};

/// Operation code of an abstract instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
	Nop,
	Ldarg,
	Ldloc,
	Stloc,
	Ldc,
	Ldstr,
	Ldfld,
	Stfld,
	/// Direct call
	Call,
	/// Virtual call
	Callvirt,
	Newobj,
	Br,
	Brtrue,
	Brfalse,
	Pop,
	Dup,
	Ret,
	/// Any opcode this crate does not model
	Other(u16),
}

/// Operand of an abstract instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Operand {
	#[default]
	None,
	Int(i64),
	Str(String),
	/// Index of an argument or local
	Slot(u16),
	/// Branch target, as an instruction index
	Label(u32),
	Field(String),
	Method(MethodSig),
}

/// One instruction of a method body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
	pub opcode: OpCode,
	pub operand: Operand,
}

impl Instruction {
	#[must_use]
	pub const fn new(opcode: OpCode, operand: Operand) -> Self {
		Self { opcode, operand }
	}

	/// Instruction without an operand
	#[must_use]
	pub const fn simple(opcode: OpCode) -> Self {
		Self::new(opcode, Operand::None)
	}

	/// Direct call to `method`
	#[must_use]
	pub const fn call(method: MethodSig) -> Self {
		Self::new(OpCode::Call, Operand::Method(method))
	}

	/// Whether this is a direct call to exactly `method`
	#[must_use]
	pub fn calls(&self, method: &MethodSig) -> bool {
		self.opcode == OpCode::Call && matches!(&self.operand, Operand::Method(callee) if callee == method)
	}
}

impl fmt::Display for Instruction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let op = match self.opcode {
			OpCode::Other(code) => return write!(f, "op_{code:#06x} {:?}", self.operand),
			other => format!("{other:?}").to_lowercase(),
		};
		match &self.operand {
			Operand::None => f.write_str(&op),
			Operand::Int(v) => write!(f, "{op} {v}"),
			Operand::Str(s) => write!(f, "{op} {s:?}"),
			Operand::Slot(s) => write!(f, "{op} {s}"),
			Operand::Label(l) => write!(f, "{op} IL_{l:04}"),
			Operand::Field(name) => write!(f, "{op} {name}"),
			Operand::Method(sig) => write!(f, "{op} {sig}"),
		}
	}
}

/// Outcome of a rewrite pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
	/// The resulting body, identical to the input when nothing applied
	pub instructions: Vec<Instruction>,
	/// Whether at least one instruction changed
	pub applied: bool,
	/// Number of instructions changed
	pub replaced: usize,
}

impl Rewrite {
	/// A rewrite that left the body alone
	#[must_use]
	pub const fn unchanged(instructions: Vec<Instruction>) -> Self {
		Self {
			instructions,
			applied: false,
			replaced: 0,
		}
	}
}

/// Trait for instruction rewrite passes
///
/// Implementations must be total and deterministic: the same input always
/// yields the same output, and well-formed input never panics.
pub trait Rewriter: Send + Sync {
	/// Rewrite one method body
	fn rewrite(&self, instructions: Vec<Instruction>) -> Rewrite;

	/// Get the name of the rewriter
	///
	/// This is used for debugging and logging purposes.
	fn name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}
}

/// Retargets direct calls from one method to another of the same shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRedirect {
	from: MethodSig,
	to: MethodSig,
}

impl CallRedirect {
	/// Create a redirect, rejecting targets whose parameter lists differ
	pub fn new(from: MethodSig, to: MethodSig) -> Result<Self> {
		if from.params != to.params {
			return Err(PatchError::IncompatibleRedirect {
				from: from.to_string(),
				to: to.to_string(),
			});
		}

		Ok(Self { from, to })
	}

	#[must_use]
	pub const fn from(&self) -> &MethodSig {
		&self.from
	}

	#[must_use]
	pub const fn to(&self) -> &MethodSig {
		&self.to
	}
}

impl Rewriter for CallRedirect {
	fn rewrite(&self, instructions: Vec<Instruction>) -> Rewrite {
		redirect_calls(instructions, &self.from, &self.to)
	}

	fn name(&self) -> &'static str {
		"CallRedirect"
	}
}

/// Replace the operand of every direct call to `from` with `to`
///
/// Everything else, including instruction order, passes through unchanged.
/// If no call matches, the input is returned as-is with `applied == false`.
#[must_use]
pub fn redirect_calls(mut instructions: Vec<Instruction>, from: &MethodSig, to: &MethodSig) -> Rewrite {
	let mut replaced = 0;

	for (index, instruction) in instructions.iter_mut().enumerate() {
		if instruction.calls(from) {
			trace!("rewrite: IL_{index:04} {instruction} -> {to}");
			instruction.operand = Operand::Method(to.clone());
			replaced += 1;
		}
	}

	if replaced == 0 {
		debug!("rewrite: no call to {from} found");
		return Rewrite::unchanged(instructions);
	}

	debug!("rewrite: redirected {replaced} call(s) from {from} to {to}");
	Rewrite {
		instructions,
		applied: true,
		replaced,
	}
}
