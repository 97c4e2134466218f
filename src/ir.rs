//! Operand-based abstract instructions
//!
//! The unstacker rewrites every stack-based source instruction into one of
//! these nodes. Operands name pseudo-registers: stack slots, locals and
//! arguments all become `(kind, index)` variables so that later dataflow
//! analysis treats them uniformly. The instruction set is a closed sum type;
//! the opcode set is fixed, so every consumer matches exhaustively.

use std::fmt;

/// Value kind of an operand or instruction result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueKind {
    /// Not yet inferred
    #[default]
    Unknown,
    /// 32-bit signed integer
    Integer,
    /// 64-bit signed integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// The null literal
    Null,
    /// A host object handle
    Object,
}

impl ValueKind {
    /// Unify two kinds during type inference.
    ///
    /// `Unknown` defers to the other side; `Null` flowing into an object
    /// position widens to `Object`. Conflicting numeric kinds keep the left
    /// side (the source stream is statically typed, so a conflict means the
    /// inference has not stabilized yet).
    pub fn unify(self, other: ValueKind) -> ValueKind {
        match (self, other) {
            (ValueKind::Unknown, k) | (k, ValueKind::Unknown) => k,
            (ValueKind::Null, ValueKind::Object) | (ValueKind::Object, ValueKind::Null) => {
                ValueKind::Object
            }
            (a, _) => a,
        }
    }

    /// True for the four numeric kinds
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueKind::Integer | ValueKind::Long | ValueKind::Float | ValueKind::Double
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Unknown => write!(f, "?"),
            ValueKind::Integer => write!(f, "i4"),
            ValueKind::Long => write!(f, "i8"),
            ValueKind::Float => write!(f, "r4"),
            ValueKind::Double => write!(f, "r8"),
            ValueKind::Null => write!(f, "null"),
            ValueKind::Object => write!(f, "obj"),
        }
    }
}

/// A literal carried by a constant operand
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Null,
}

impl ConstValue {
    /// The value kind of this literal
    pub fn kind(&self) -> ValueKind {
        match self {
            ConstValue::I32(_) => ValueKind::Integer,
            ConstValue::I64(_) => ValueKind::Long,
            ConstValue::F32(_) => ValueKind::Float,
            ConstValue::F64(_) => ValueKind::Double,
            ConstValue::Null => ValueKind::Null,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::I32(v) => write!(f, "{}", v),
            ConstValue::I64(v) => write!(f, "{}L", v),
            ConstValue::F32(v) => write!(f, "{}f", v),
            ConstValue::F64(v) => write!(f, "{}d", v),
            ConstValue::Null => write!(f, "null"),
        }
    }
}

/// Operand kind: which pseudo-register bank a variable lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VarKind {
    /// Method argument (caller populated)
    Arg,
    /// Method local
    Local,
    /// Operand-stack slot, numbered by depth
    Stack,
    /// Compiler temporary (phi-resolution cycle breaks)
    Tmp,
    /// Inline literal
    Const,
    /// Metadata side-table index (method/field/type token)
    Meta,
    /// Concrete VM register, assigned by the allocator
    Reg,
}

/// Version number meaning "not yet SSA-named"
pub const NO_VERSION: i32 = -1;

/// Variable identity: two operands are the same variable iff kind and index
/// match (versions distinguish SSA values of one variable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId {
    pub kind: VarKind,
    pub index: u32,
}

/// SSA value identity: kind, index and version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SsaId {
    pub kind: VarKind,
    pub index: u32,
    pub version: i32,
}

/// A `(kind, index, version)` operand triple
///
/// Constant operands additionally carry their literal; every operand carries
/// the value kind the type-inference pass settled on (`Unknown` before that).
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub kind: VarKind,
    pub index: u32,
    pub version: i32,
    pub ty: ValueKind,
    pub konst: Option<ConstValue>,
}

impl Operand {
    fn var(kind: VarKind, index: u32) -> Self {
        Operand {
            kind,
            index,
            version: NO_VERSION,
            ty: ValueKind::Unknown,
            konst: None,
        }
    }

    /// A fresh unversioned operand for an existing variable identity
    pub fn from_id(var: VarId) -> Self {
        Self::var(var.kind, var.index)
    }

    /// An operand-stack slot
    pub fn stack(index: u32) -> Self {
        Self::var(VarKind::Stack, index)
    }

    /// A method local
    pub fn local(index: u32) -> Self {
        Self::var(VarKind::Local, index)
    }

    /// A method argument
    pub fn arg(index: u32) -> Self {
        Self::var(VarKind::Arg, index)
    }

    /// A compiler temporary
    pub fn tmp(index: u32) -> Self {
        Self::var(VarKind::Tmp, index)
    }

    /// A concrete VM register
    pub fn reg(index: u32) -> Self {
        Self::var(VarKind::Reg, index)
    }

    /// A metadata token (not a dataflow value)
    pub fn meta(index: u32) -> Self {
        Self::var(VarKind::Meta, index)
    }

    /// An inline literal
    pub fn konst(value: ConstValue) -> Self {
        Operand {
            kind: VarKind::Const,
            index: 0,
            version: NO_VERSION,
            ty: value.kind(),
            konst: Some(value),
        }
    }

    /// True for constant operands
    pub fn is_const(&self) -> bool {
        self.kind == VarKind::Const
    }

    /// True for operands that participate in dataflow (everything except
    /// constants and metadata tokens)
    pub fn is_var(&self) -> bool {
        !matches!(self.kind, VarKind::Const | VarKind::Meta)
    }

    /// Variable identity, if this operand is a variable
    pub fn var_id(&self) -> Option<VarId> {
        self.is_var().then_some(VarId {
            kind: self.kind,
            index: self.index,
        })
    }

    /// SSA value identity, if this operand is a variable
    pub fn ssa_id(&self) -> Option<SsaId> {
        self.is_var().then_some(SsaId {
            kind: self.kind,
            index: self.index,
            version: self.version,
        })
    }

    /// True if `other` names the same variable (ignoring versions)
    pub fn same_var(&self, other: &Operand) -> bool {
        self.is_var() && self.kind == other.kind && self.index == other.index
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            VarKind::Const => match self.konst {
                Some(c) => write!(f, "{}", c),
                None => write!(f, "<bad const>"),
            },
            VarKind::Meta => write!(f, "#{}", self.index),
            VarKind::Reg => write!(f, "r{}", self.index),
            kind => {
                let bank = match kind {
                    VarKind::Arg => "a",
                    VarKind::Local => "l",
                    VarKind::Stack => "s",
                    VarKind::Tmp => "t",
                    _ => unreachable!(),
                };
                if self.version >= 0 {
                    write!(f, "{}{}.{}", bank, self.index, self.version)
                } else {
                    write!(f, "{}{}", bank, self.index)
                }
            }
        }
    }
}

/// Binary arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Comparison conditions, shared by `Compare` and `Branch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Le => "le",
            Cond::Gt => "gt",
            Cond::Ge => "ge",
        };
        write!(f, "{}", s)
    }
}

/// An abstract instruction
///
/// At most one definition ("right-hand" operand), a fixed or variable set of
/// uses, and explicit block targets on the branching variants. A `Nop` marks
/// an instruction killed by copy propagation; the optimizer filters them out
/// before register allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Nop,
    Move {
        dst: Operand,
        src: Operand,
    },
    /// SSA phi: selects `args[i].1` when control arrived from block `args[i].0`
    Phi {
        dst: Operand,
        args: Vec<(usize, Operand)>,
    },
    Unary {
        op: UnaryOp,
        dst: Operand,
        src: Operand,
    },
    Binary {
        op: BinaryOp,
        /// Overflow-checked form (faults instead of wrapping)
        checked: bool,
        dst: Operand,
        lhs: Operand,
        rhs: Operand,
    },
    Compare {
        cond: Cond,
        dst: Operand,
        lhs: Operand,
        rhs: Operand,
    },
    Convert {
        to: ValueKind,
        dst: Operand,
        src: Operand,
    },
    Jump {
        target: usize,
    },
    Branch {
        cond: Cond,
        lhs: Operand,
        rhs: Operand,
        target: usize,
    },
    Call {
        /// Meta operand: method table index
        method: Operand,
        args: Vec<Operand>,
        dst: Option<Operand>,
    },
    NewObj {
        /// Meta operand: constructor method table index
        ctor: Operand,
        args: Vec<Operand>,
        dst: Operand,
    },
    LoadField {
        /// Meta operand: field table index
        field: Operand,
        obj: Operand,
        dst: Operand,
    },
    StoreField {
        field: Operand,
        obj: Operand,
        src: Operand,
    },
    LoadStatic {
        field: Operand,
        dst: Operand,
    },
    StoreStatic {
        field: Operand,
        src: Operand,
    },
    Ret {
        src: Option<Operand>,
    },
}

impl Inst {
    /// The "left-hand" (use) operands, in evaluation order.
    ///
    /// Metadata tokens are not dataflow uses and are not returned here.
    pub fn uses(&self) -> Vec<&Operand> {
        match self {
            Inst::Nop | Inst::Jump { .. } => vec![],
            Inst::Move { src, .. } => vec![src],
            Inst::Phi { args, .. } => args.iter().map(|(_, op)| op).collect(),
            Inst::Unary { src, .. } => vec![src],
            Inst::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Compare { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Convert { src, .. } => vec![src],
            Inst::Branch { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Call { args, .. } => args.iter().collect(),
            Inst::NewObj { args, .. } => args.iter().collect(),
            Inst::LoadField { obj, .. } => vec![obj],
            Inst::StoreField { obj, src, .. } => vec![obj, src],
            Inst::LoadStatic { .. } => vec![],
            Inst::StoreStatic { src, .. } => vec![src],
            Inst::Ret { src } => src.iter().collect(),
        }
    }

    /// Mutable view of the use operands
    pub fn uses_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            Inst::Nop | Inst::Jump { .. } => vec![],
            Inst::Move { src, .. } => vec![src],
            Inst::Phi { args, .. } => args.iter_mut().map(|(_, op)| op).collect(),
            Inst::Unary { src, .. } => vec![src],
            Inst::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Compare { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Convert { src, .. } => vec![src],
            Inst::Branch { lhs, rhs, .. } => vec![lhs, rhs],
            Inst::Call { args, .. } => args.iter_mut().collect(),
            Inst::NewObj { args, .. } => args.iter_mut().collect(),
            Inst::LoadField { obj, .. } => vec![obj],
            Inst::StoreField { obj, src, .. } => vec![obj, src],
            Inst::LoadStatic { .. } => vec![],
            Inst::StoreStatic { src, .. } => vec![src],
            Inst::Ret { src } => src.iter_mut().collect(),
        }
    }

    /// The "right-hand" (definition) operand, if any
    pub fn def(&self) -> Option<&Operand> {
        match self {
            Inst::Move { dst, .. }
            | Inst::Phi { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::Binary { dst, .. }
            | Inst::Compare { dst, .. }
            | Inst::Convert { dst, .. }
            | Inst::NewObj { dst, .. }
            | Inst::LoadField { dst, .. }
            | Inst::LoadStatic { dst, .. } => Some(dst),
            Inst::Call { dst, .. } => dst.as_ref(),
            _ => None,
        }
    }

    /// Mutable view of the definition operand
    pub fn def_mut(&mut self) -> Option<&mut Operand> {
        match self {
            Inst::Move { dst, .. }
            | Inst::Phi { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::Binary { dst, .. }
            | Inst::Compare { dst, .. }
            | Inst::Convert { dst, .. }
            | Inst::NewObj { dst, .. }
            | Inst::LoadField { dst, .. }
            | Inst::LoadStatic { dst, .. } => Some(dst),
            Inst::Call { dst, .. } => dst.as_mut(),
            _ => None,
        }
    }

    /// Explicit block targets of a branching instruction
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Inst::Jump { target } | Inst::Branch { target, .. } => vec![*target],
            _ => vec![],
        }
    }

    /// Repoint a branch target (critical-edge splitting)
    pub fn retarget(&mut self, from: usize, to: usize) {
        match self {
            Inst::Jump { target } | Inst::Branch { target, .. } if *target == from => {
                *target = to;
            }
            _ => {}
        }
    }

    /// True for instructions that end a block
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Jump { .. } | Inst::Branch { .. } | Inst::Ret { .. })
    }

    /// True for terminators after which control never falls through
    pub fn is_unconditional(&self) -> bool {
        matches!(self, Inst::Jump { .. } | Inst::Ret { .. })
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Nop => write!(f, "nop"),
            Inst::Move { dst, src } => write!(f, "{} = {}", dst, src),
            Inst::Phi { dst, args } => {
                write!(f, "{} = phi", dst)?;
                for (block, op) in args {
                    write!(f, " [b{}: {}]", block, op)?;
                }
                Ok(())
            }
            Inst::Unary { op, dst, src } => {
                let name = match op {
                    UnaryOp::Neg => "neg",
                    UnaryOp::Not => "not",
                };
                write!(f, "{} = {} {}", dst, name, src)
            }
            Inst::Binary {
                op,
                checked,
                dst,
                lhs,
                rhs,
            } => {
                let suffix = if *checked { ".ovf" } else { "" };
                write!(f, "{} = {}{} {}, {}", dst, op, suffix, lhs, rhs)
            }
            Inst::Compare {
                cond,
                dst,
                lhs,
                rhs,
            } => write!(f, "{} = c{} {}, {}", dst, cond, lhs, rhs),
            Inst::Convert { to, dst, src } => write!(f, "{} = conv.{} {}", dst, to, src),
            Inst::Jump { target } => write!(f, "jmp b{}", target),
            Inst::Branch {
                cond,
                lhs,
                rhs,
                target,
            } => write!(f, "b{} {}, {} -> b{}", cond, lhs, rhs, target),
            Inst::Call { method, args, dst } => {
                if let Some(dst) = dst {
                    write!(f, "{} = call {}", dst, method)?;
                } else {
                    write!(f, "call {}", method)?;
                }
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            Inst::NewObj { ctor, args, dst } => {
                write!(f, "{} = newobj {}", dst, ctor)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            Inst::LoadField { field, obj, dst } => {
                write!(f, "{} = ldfld {} {}", dst, field, obj)
            }
            Inst::StoreField { field, obj, src } => {
                write!(f, "stfld {} {}, {}", field, obj, src)
            }
            Inst::LoadStatic { field, dst } => write!(f, "{} = ldsfld {}", dst, field),
            Inst::StoreStatic { field, src } => write!(f, "stsfld {}, {}", field, src),
            Inst::Ret { src } => match src {
                Some(op) => write!(f, "ret {}", op),
                None => write!(f, "ret"),
            },
        }
    }
}
