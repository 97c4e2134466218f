//! Bytecode emission
//!
//! Lowers the register-allocated graph into the flat encoding the VM
//! executes. Blocks are laid out in graph order; forward branch payloads are
//! back-patched once every block's start offset is known. Displacements are
//! relative to the branch instruction's own first byte.
//!
//! Two register windows sit above the allocated slots: a contiguous argument
//! window that bridge calls are marshaled through, and two scratch slots for
//! materializing constants the instruction forms cannot carry inline (only
//! 32-bit integer immediates have dedicated forms).

use crate::cfg::Cfg;
use crate::error::{Error, Result};
use crate::il::MethodBody;
use crate::ir::{BinaryOp, Cond, ConstValue, Inst, Operand, UnaryOp, ValueKind, VarKind};
use crate::regalloc::{Allocation, REGISTER_LIMIT};
use crate::vm::bridge::SymbolTables;
use crate::vm::opcode::{read_i32, read_u16, read_u32, read_u64, Form, VmOp};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A compiled method body, ready to execute or snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub code: Vec<u8>,
    /// Metadata side tables the bridge instructions index into
    pub tables: SymbolTables,
    /// Registers the body addresses, marshaling windows included
    pub register_count: u16,
    pub arg_count: u16,
    /// True when the body produces no value
    pub void: bool,
    /// Code offset each basic block starts at
    pub block_starts: Vec<u32>,
}

/// Encode a lowered graph into a [`Program`].
pub fn emit(
    cfg: &Cfg,
    alloc: &Allocation,
    tables: &SymbolTables,
    body: &MethodBody,
) -> Result<Program> {
    let max_args = cfg
        .blocks
        .iter()
        .flat_map(|b| &b.instrs)
        .map(|inst| match inst {
            Inst::Call { args, .. } | Inst::NewObj { args, .. } => args.len(),
            _ => 0,
        })
        .max()
        .unwrap_or(0);
    let arg_window = alloc.register_count as usize;
    let scratch = arg_window + max_args;
    let register_count = scratch + 2;
    if register_count > REGISTER_LIMIT {
        return Err(Error::RegisterPressure {
            needed: register_count,
            limit: REGISTER_LIMIT,
        });
    }

    let mut e = Emitter {
        code: Vec::new(),
        block_starts: vec![0; cfg.len()],
        patches: Vec::new(),
        arg_window: arg_window as u8,
        scratch: [scratch as u8, scratch as u8 + 1],
    };

    for (index, block) in cfg.blocks.iter().enumerate() {
        e.block_starts[index] = e.code.len() as u32;
        for inst in &block.instrs {
            // A jump to the block laid out next is a fallthrough.
            if let Inst::Jump { target } = inst {
                if *target == index + 1 {
                    continue;
                }
            }
            e.inst(inst, tables)?;
        }
    }

    for (payload, inst_start, target) in std::mem::take(&mut e.patches) {
        let disp = e.block_starts[target] as i64 - inst_start as i64;
        e.code[payload..payload + 4].copy_from_slice(&(disp as i32).to_le_bytes());
    }

    debug!(
        method = %body.name,
        bytes = e.code.len(),
        registers = register_count,
        "emitted"
    );
    Ok(Program {
        name: body.name.clone(),
        code: e.code,
        tables: tables.clone(),
        register_count: register_count as u16,
        arg_count: body.arg_count,
        void: body.is_void(),
        block_starts: e.block_starts,
    })
}

struct Emitter {
    code: Vec<u8>,
    block_starts: Vec<u32>,
    /// (payload offset, instruction start, target block) to back-patch
    patches: Vec<(usize, usize, usize)>,
    arg_window: u8,
    scratch: [u8; 2],
}

impl Emitter {
    fn tag(&mut self, op: VmOp) {
        self.code.extend_from_slice(&(op as u16).to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Reserve a branch payload, recording the patch site.
    fn disp(&mut self, inst_start: usize, target: usize) {
        self.patches.push((self.code.len(), inst_start, target));
        self.u32(0);
    }

    fn reg(op: &Operand) -> Result<u8> {
        if op.kind != VarKind::Reg {
            return Err(Error::InternalError(format!(
                "unallocated operand {} reached emission",
                op
            )));
        }
        Ok(op.index as u8)
    }

    /// The register holding `op`, materializing a constant into `scratch`.
    fn value_reg(&mut self, op: &Operand, scratch: u8) -> Result<u8> {
        match op.konst {
            Some(c) => {
                self.load_const(scratch, c);
                Ok(scratch)
            }
            None => Self::reg(op),
        }
    }

    fn load_const(&mut self, dst: u8, c: ConstValue) {
        match c {
            ConstValue::I32(v) => {
                self.tag(VmOp::LdcI32);
                self.code.push(dst);
                self.u32(v as u32);
            }
            ConstValue::I64(v) => {
                self.tag(VmOp::LdcI64);
                self.code.push(dst);
                self.u64(v as u64);
            }
            ConstValue::F32(v) => {
                self.tag(VmOp::LdcF32);
                self.code.push(dst);
                self.u32(v.to_bits());
            }
            ConstValue::F64(v) => {
                self.tag(VmOp::LdcF64);
                self.code.push(dst);
                self.u64(v.to_bits());
            }
            ConstValue::Null => {
                self.tag(VmOp::LdNull);
                self.code.push(dst);
            }
        }
    }

    fn mov(&mut self, dst: u8, src: u8) {
        if dst != src {
            self.tag(VmOp::Mov);
            self.code.push(dst);
            self.code.push(src);
        }
    }

    fn inst(&mut self, inst: &Inst, tables: &SymbolTables) -> Result<()> {
        match inst {
            Inst::Nop => {}
            Inst::Phi { .. } => {
                return Err(Error::InternalError("phi reached emission".into()));
            }
            Inst::Move { dst, src } => {
                let dst = Self::reg(dst)?;
                match src.konst {
                    Some(c) => self.load_const(dst, c),
                    None => {
                        let src = Self::reg(src)?;
                        self.mov(dst, src);
                    }
                }
            }
            Inst::Unary { op, dst, src } => {
                let opcode = unary_op(*op, src.ty)?;
                let dst = Self::reg(dst)?;
                let src = self.value_reg(src, self.scratch[0])?;
                self.tag(opcode);
                self.code.push(dst);
                self.code.push(src);
            }
            Inst::Binary {
                op,
                checked,
                dst,
                lhs,
                rhs,
            } => {
                let ty = dst.ty;
                let dst = Self::reg(dst)?;
                if let Some(imm) = imm_binary(*op, ty, rhs).filter(|_| !checked) {
                    let lhs = self.value_reg(lhs, self.scratch[0])?;
                    self.tag(imm.0);
                    self.code.push(dst);
                    self.code.push(lhs);
                    self.u32(imm.1 as u32);
                    return Ok(());
                }
                let opcode = binary_op(*op, ty, *checked)?;
                let lhs = self.value_reg(lhs, self.scratch[0])?;
                let rhs = self.value_reg(rhs, self.scratch[1])?;
                self.tag(opcode);
                self.code.push(dst);
                self.code.push(lhs);
                self.code.push(rhs);
            }
            Inst::Compare {
                cond,
                dst,
                lhs,
                rhs,
            } => {
                let ty = lhs.ty.unify(rhs.ty);
                let dst = Self::reg(dst)?;
                if ty == ValueKind::Integer {
                    if let Some(ConstValue::I32(imm)) = rhs.konst {
                        let lhs = self.value_reg(lhs, self.scratch[0])?;
                        self.tag(typed_op(VmOp::CmpEqI32Imm, *cond, 0)?);
                        self.code.push(dst);
                        self.code.push(lhs);
                        self.u32(imm as u32);
                        return Ok(());
                    }
                }
                let opcode = typed_op(VmOp::CmpEqI32, *cond, type_offset(ty)?)?;
                let lhs = self.value_reg(lhs, self.scratch[0])?;
                let rhs = self.value_reg(rhs, self.scratch[1])?;
                self.tag(opcode);
                self.code.push(dst);
                self.code.push(lhs);
                self.code.push(rhs);
            }
            Inst::Convert { to, dst, src } => {
                let dst = Self::reg(dst)?;
                let from = src.ty;
                let src = self.value_reg(src, self.scratch[0])?;
                match conv_op(from, *to)? {
                    Some(opcode) => {
                        self.tag(opcode);
                        self.code.push(dst);
                        self.code.push(src);
                    }
                    None => self.mov(dst, src),
                }
            }
            Inst::Jump { target } => {
                let start = self.code.len();
                self.tag(VmOp::Jmp);
                self.disp(start, *target);
            }
            Inst::Branch {
                cond,
                lhs,
                rhs,
                target,
            } => {
                let ty = lhs.ty.unify(rhs.ty);
                if ty == ValueKind::Integer {
                    if let Some(ConstValue::I32(imm)) = rhs.konst {
                        let lhs = self.value_reg(lhs, self.scratch[0])?;
                        let start = self.code.len();
                        self.tag(typed_op(VmOp::BrEqI32Imm, *cond, 0)?);
                        self.code.push(lhs);
                        self.u32(imm as u32);
                        self.disp(start, *target);
                        return Ok(());
                    }
                }
                let opcode = typed_op(VmOp::BrEqI32, *cond, type_offset(ty)?)?;
                let lhs = self.value_reg(lhs, self.scratch[0])?;
                let rhs = self.value_reg(rhs, self.scratch[1])?;
                let start = self.code.len();
                self.tag(opcode);
                self.code.push(lhs);
                self.code.push(rhs);
                self.disp(start, *target);
            }
            Inst::Call { method, args, dst } => {
                tables.method(method.index)?;
                self.marshal(args)?;
                let result = match dst {
                    Some(d) => Self::reg(d)?,
                    None => 0,
                };
                self.tag(VmOp::CallNative);
                self.code.push(result);
                self.code.push(self.arg_window);
                self.u32(method.index);
            }
            Inst::NewObj { ctor, args, dst } => {
                tables.method(ctor.index)?;
                self.marshal(args)?;
                let dst = Self::reg(dst)?;
                self.tag(VmOp::NewObj);
                self.code.push(dst);
                self.code.push(self.arg_window);
                self.u32(ctor.index);
            }
            Inst::LoadField { field, obj, dst } => {
                let dst = Self::reg(dst)?;
                let obj = self.value_reg(obj, self.scratch[0])?;
                self.tag(VmOp::LdFld);
                self.code.push(dst);
                self.code.push(obj);
                self.u32(field.index);
            }
            Inst::StoreField { field, obj, src } => {
                let obj = self.value_reg(obj, self.scratch[0])?;
                let src = self.value_reg(src, self.scratch[1])?;
                self.tag(VmOp::StFld);
                self.code.push(obj);
                self.code.push(src);
                self.u32(field.index);
            }
            Inst::LoadStatic { field, dst } => {
                let dst = Self::reg(dst)?;
                self.tag(VmOp::LdSFld);
                self.code.push(dst);
                self.u32(field.index);
            }
            Inst::StoreStatic { field, src } => {
                let src = self.value_reg(src, self.scratch[0])?;
                self.tag(VmOp::StSFld);
                self.code.push(src);
                self.u32(field.index);
            }
            Inst::Ret { src } => {
                if let Some(src) = src {
                    match src.konst {
                        Some(c) => self.load_const(0, c),
                        None => {
                            let src = Self::reg(src)?;
                            self.mov(0, src);
                        }
                    }
                }
                self.tag(VmOp::Ret);
            }
        }
        Ok(())
    }

    /// Move call arguments into the contiguous argument window.
    fn marshal(&mut self, args: &[Operand]) -> Result<()> {
        for (i, arg) in args.iter().enumerate() {
            let dst = self.arg_window + i as u8;
            match arg.konst {
                Some(c) => self.load_const(dst, c),
                None => {
                    let src = Self::reg(arg)?;
                    self.mov(dst, src);
                }
            }
        }
        Ok(())
    }
}

/// Offset between the I32 opcode of a typed family and the family member for
/// `ty` (families are laid out I32, I64, F32, F64, six conditions each)
fn type_offset(ty: ValueKind) -> Result<u16> {
    match ty {
        ValueKind::Integer => Ok(0),
        ValueKind::Long => Ok(6),
        ValueKind::Float => Ok(12),
        ValueKind::Double => Ok(18),
        // Handles compare equal as integers.
        ValueKind::Object | ValueKind::Null => Ok(0),
        ValueKind::Unknown => Ok(0),
    }
}

fn cond_offset(cond: Cond) -> u16 {
    match cond {
        Cond::Eq => 0,
        Cond::Ne => 1,
        Cond::Lt => 2,
        Cond::Le => 3,
        Cond::Gt => 4,
        Cond::Ge => 5,
    }
}

/// Member of a condition-by-type opcode family
fn typed_op(base: VmOp, cond: Cond, ty_offset: u16) -> Result<VmOp> {
    VmOp::from_u16(base as u16 + ty_offset + cond_offset(cond))
        .ok_or_else(|| Error::InternalError("opcode family overflow".into()))
}

fn binary_op(op: BinaryOp, ty: ValueKind, checked: bool) -> Result<VmOp> {
    use BinaryOp::*;
    use VmOp::*;
    let opcode = match (ty, op, checked) {
        (ValueKind::Integer, Add, true) => AddI32Chk,
        (ValueKind::Integer, Sub, true) => SubI32Chk,
        (ValueKind::Integer, Mul, true) => MulI32Chk,
        (ValueKind::Integer, Add, _) => AddI32,
        (ValueKind::Integer, Sub, _) => SubI32,
        (ValueKind::Integer, Mul, _) => MulI32,
        (ValueKind::Integer, Div, _) => DivI32,
        (ValueKind::Integer, Rem, _) => RemI32,
        (ValueKind::Integer, And, _) => AndI32,
        (ValueKind::Integer, Or, _) => OrI32,
        (ValueKind::Integer, Xor, _) => XorI32,
        (ValueKind::Integer, Shl, _) => ShlI32,
        (ValueKind::Integer, Shr, _) => ShrI32,
        (ValueKind::Long, Add, true) => AddI64Chk,
        (ValueKind::Long, Sub, true) => SubI64Chk,
        (ValueKind::Long, Mul, true) => MulI64Chk,
        (ValueKind::Long, Add, _) => AddI64,
        (ValueKind::Long, Sub, _) => SubI64,
        (ValueKind::Long, Mul, _) => MulI64,
        (ValueKind::Long, Div, _) => DivI64,
        (ValueKind::Long, Rem, _) => RemI64,
        (ValueKind::Long, And, _) => AndI64,
        (ValueKind::Long, Or, _) => OrI64,
        (ValueKind::Long, Xor, _) => XorI64,
        (ValueKind::Long, Shl, _) => ShlI64,
        (ValueKind::Long, Shr, _) => ShrI64,
        // Float overflow cannot fault, so checked forms lower to plain ones.
        (ValueKind::Float, Add, _) => AddF32,
        (ValueKind::Float, Sub, _) => SubF32,
        (ValueKind::Float, Mul, _) => MulF32,
        (ValueKind::Float, Div, _) => DivF32,
        (ValueKind::Float, Rem, _) => RemF32,
        (ValueKind::Double, Add, _) => AddF64,
        (ValueKind::Double, Sub, _) => SubF64,
        (ValueKind::Double, Mul, _) => MulF64,
        (ValueKind::Double, Div, _) => DivF64,
        (ValueKind::Double, Rem, _) => RemF64,
        _ => {
            return Err(Error::InternalError(format!(
                "no {:?} opcode for {}",
                op, ty
            )));
        }
    };
    Ok(opcode)
}

/// Immediate form for integer add/sub/mul with a constant right operand
fn imm_binary(op: BinaryOp, ty: ValueKind, rhs: &Operand) -> Option<(VmOp, i32)> {
    if ty != ValueKind::Integer {
        return None;
    }
    let Some(ConstValue::I32(v)) = rhs.konst else {
        return None;
    };
    let opcode = match op {
        BinaryOp::Add => VmOp::AddI32Imm,
        BinaryOp::Sub => VmOp::SubI32Imm,
        BinaryOp::Mul => VmOp::MulI32Imm,
        _ => return None,
    };
    Some((opcode, v))
}

fn unary_op(op: UnaryOp, ty: ValueKind) -> Result<VmOp> {
    let opcode = match (op, ty) {
        (UnaryOp::Neg, ValueKind::Integer) => VmOp::NegI32,
        (UnaryOp::Neg, ValueKind::Long) => VmOp::NegI64,
        (UnaryOp::Neg, ValueKind::Float) => VmOp::NegF32,
        (UnaryOp::Neg, ValueKind::Double) => VmOp::NegF64,
        (UnaryOp::Not, ValueKind::Integer) => VmOp::NotI32,
        (UnaryOp::Not, ValueKind::Long) => VmOp::NotI64,
        _ => {
            return Err(Error::InternalError(format!(
                "no {:?} opcode for {}",
                op, ty
            )));
        }
    };
    Ok(opcode)
}

/// Conversion opcode, or `None` when the kinds share a representation
fn conv_op(from: ValueKind, to: ValueKind) -> Result<Option<VmOp>> {
    use ValueKind::*;
    let opcode = match (from, to) {
        (Integer, Long) => VmOp::I32ToI64,
        (Integer, Float) => VmOp::I32ToF32,
        (Integer, Double) => VmOp::I32ToF64,
        (Long, Integer) => VmOp::I64ToI32,
        (Long, Float) => VmOp::I64ToF32,
        (Long, Double) => VmOp::I64ToF64,
        (Float, Integer) => VmOp::F32ToI32,
        (Float, Long) => VmOp::F32ToI64,
        (Float, Double) => VmOp::F32ToF64,
        (Double, Integer) => VmOp::F64ToI32,
        (Double, Long) => VmOp::F64ToI64,
        (Double, Float) => VmOp::F64ToF32,
        (a, b) if a == b => return Ok(None),
        (Unknown, _) | (_, Unknown) => return Ok(None),
        (a, b) => {
            return Err(Error::InternalError(format!(
                "no conversion from {} to {}",
                a, b
            )));
        }
    };
    Ok(Some(opcode))
}

// ========== Disassembly ==========

impl Program {
    /// Render the encoded body, one instruction per line.
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let code = &self.code;
        let mut pos = 0usize;
        while pos + 2 <= code.len() {
            if let Some(block) = self.block_starts.iter().position(|&s| s as usize == pos) {
                let _ = writeln!(out, "b{}:", block);
            }
            let Some(op) = VmOp::from_u16(read_u16(code, pos)) else {
                let _ = writeln!(out, "{:04}  ?? {:#06x}", pos, read_u16(code, pos));
                break;
            };
            let _ = write!(out, "{:04}  {:?}", pos, op);
            let f = pos + 2;
            match op.form() {
                Form::Op => {}
                Form::A => {
                    let _ = write!(out, " r{}", code[f]);
                }
                Form::AB => {
                    let _ = write!(out, " r{}, r{}", code[f], code[f + 1]);
                }
                Form::ABC => {
                    let _ = write!(out, " r{}, r{}, r{}", code[f], code[f + 1], code[f + 2]);
                }
                Form::AP => {
                    let _ = write!(out, " r{}, {:#x}", code[f], read_u32(code, f + 1));
                }
                Form::ALP => {
                    let _ = write!(out, " r{}, {:#x}", code[f], read_u64(code, f + 1));
                }
                Form::P => {
                    let disp = read_i32(code, f);
                    let _ = write!(out, " -> {:+} ({})", disp, pos as i64 + disp as i64);
                }
                Form::ABP => {
                    let payload = read_u32(code, f + 2);
                    if is_branch(op) {
                        let disp = payload as i32;
                        let _ = write!(
                            out,
                            " r{}, r{} -> {:+} ({})",
                            code[f],
                            code[f + 1],
                            disp,
                            pos as i64 + disp as i64
                        );
                    } else {
                        let _ = write!(out, " r{}, r{}, {:#x}", code[f], code[f + 1], payload);
                    }
                }
                Form::APP => {
                    let imm = read_i32(code, f + 1);
                    let disp = read_i32(code, f + 5);
                    let _ = write!(
                        out,
                        " r{}, {} -> {:+} ({})",
                        code[f],
                        imm,
                        disp,
                        pos as i64 + disp as i64
                    );
                }
            }
            let _ = writeln!(out);
            pos += op.form().width();
        }
        out
    }
}

/// ABP opcodes whose payload is a displacement rather than an index or
/// immediate
fn is_branch(op: VmOp) -> bool {
    (op as u16) >= VmOp::BrEqI32 as u16 && (op as u16) <= VmOp::BrGeF64 as u16
}
