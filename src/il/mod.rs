//! Source instruction stream model
//!
//! The input to the compiler: a single method body in the stack-based
//! intermediate form produced by a managed, object-oriented execution
//! environment. Method, field and type references are dense indices into the
//! session metadata tables (the container reader that produces them is an
//! external collaborator). Branch targets are instruction indices into the
//! body's stream.

mod asm;

pub use asm::parse_method;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Method body attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BodyFlags: u8 {
        /// Method has a `this` receiver in argument slot 0
        const INSTANCE = 0b0000_0001;
        /// Method returns no value
        const VOID = 0b0000_0010;
    }
}

/// A stack-based source opcode
///
/// The operand-stack discipline is implicit: each opcode pops a fixed number
/// of slots and pushes at most one (calls pop per their signature). The
/// `Unsupported` variant carries opcodes the container reader recognized but
/// this compiler does not translate; lifting one is a fatal compile error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IlOp {
    // ========== Loads and stores ==========
    /// Push argument `n`
    LdArg(u16),
    /// Push local `n`
    LdLoc(u16),
    /// Pop into local `n`
    StLoc(u16),
    /// Push a 32-bit integer constant
    LdcI4(i32),
    /// Push a 64-bit integer constant
    LdcI8(i64),
    /// Push a 32-bit float constant
    LdcR4(f32),
    /// Push a 64-bit float constant
    LdcR8(f64),
    /// Push the null reference
    LdNull,
    /// Duplicate the top slot
    Dup,
    /// Discard the top slot
    Pop,

    // ========== Arithmetic ==========
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    /// Overflow-checked add
    AddOvf,
    /// Overflow-checked subtract
    SubOvf,
    /// Overflow-checked multiply
    MulOvf,

    // ========== Bitwise ==========
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Not,

    // ========== Comparison (push 0/1) ==========
    Ceq,
    Cgt,
    Clt,

    // ========== Conversions ==========
    ConvI4,
    ConvI8,
    ConvR4,
    ConvR8,

    // ========== Control flow (targets are instruction indices) ==========
    Br(usize),
    BrTrue(usize),
    BrFalse(usize),
    Beq(usize),
    Bne(usize),
    Blt(usize),
    Ble(usize),
    Bgt(usize),
    Bge(usize),
    Ret,

    // ========== Metadata-indexed ==========
    /// Call method table entry `n`
    Call(u32),
    /// Allocate and run constructor table entry `n`
    NewObj(u32),
    /// Push instance field `n` of the popped object
    LdFld(u32),
    /// Pop value and object, store into instance field `n`
    StFld(u32),
    /// Push static field `n`
    LdsFld(u32),
    /// Pop into static field `n`
    StsFld(u32),

    /// An opcode outside the supported subset (mnemonic preserved for the error)
    Unsupported(String),
}

impl IlOp {
    /// Branch target, if this is a branching opcode
    pub fn branch_target(&self) -> Option<usize> {
        match self {
            IlOp::Br(t)
            | IlOp::BrTrue(t)
            | IlOp::BrFalse(t)
            | IlOp::Beq(t)
            | IlOp::Bne(t)
            | IlOp::Blt(t)
            | IlOp::Ble(t)
            | IlOp::Bgt(t)
            | IlOp::Bge(t) => Some(*t),
            _ => None,
        }
    }

    /// True for instructions that transfer control (the next instruction is a leader)
    pub fn is_control_transfer(&self) -> bool {
        self.branch_target().is_some() || matches!(self, IlOp::Ret)
    }

    /// True for transfers after which control never falls through
    pub fn is_unconditional(&self) -> bool {
        matches!(self, IlOp::Br(_) | IlOp::Ret)
    }
}

/// One instruction of the source stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IlInst {
    /// Index in the body's instruction stream
    pub offset: usize,
    pub op: IlOp,
}

/// A single method body: the unit of compilation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    /// Method identifier used for patch-target matching and diagnostics
    pub name: String,
    pub instructions: Vec<IlInst>,
    /// Number of arguments (including the receiver for instance methods)
    pub arg_count: u16,
    /// Number of locals (zero-initialized on entry)
    pub local_count: u16,
    pub flags: BodyFlags,
}

impl MethodBody {
    /// Create an empty static, value-returning body
    pub fn new(name: impl Into<String>, arg_count: u16, local_count: u16) -> Self {
        MethodBody {
            name: name.into(),
            instructions: Vec::new(),
            arg_count,
            local_count,
            flags: BodyFlags::empty(),
        }
    }

    /// Append an instruction, assigning the next stream index
    pub fn push(&mut self, op: IlOp) -> usize {
        let offset = self.instructions.len();
        self.instructions.push(IlInst { offset, op });
        offset
    }

    /// True if the method produces no value
    pub fn is_void(&self) -> bool {
        self.flags.contains(BodyFlags::VOID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_building() {
        let mut body = MethodBody::new("add2", 2, 0);
        body.push(IlOp::LdArg(0));
        body.push(IlOp::LdArg(1));
        body.push(IlOp::Add);
        let ret = body.push(IlOp::Ret);
        assert_eq!(ret, 3);
        assert_eq!(body.instructions[2].offset, 2);
        assert!(!body.is_void());
    }

    #[test]
    fn test_branch_classification() {
        assert_eq!(IlOp::Beq(7).branch_target(), Some(7));
        assert!(IlOp::Br(0).is_unconditional());
        assert!(!IlOp::BrTrue(0).is_unconditional());
        assert!(IlOp::Ret.is_control_transfer());
        assert!(!IlOp::Add.is_control_transfer());
    }
}
