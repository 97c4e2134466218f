//! Value-kind inference over SSA values
//!
//! The source stream is statically typed but carries no per-slot
//! annotations, so kinds are recovered by fixpoint unification: constants and
//! metadata signatures seed the solution, moves and phis propagate it, and
//! binary operands unify with each other. Emission needs a concrete kind for
//! every operand; anything still unknown at the end (an argument never used
//! numerically, say) defaults to a 32-bit integer.

use crate::cfg::Cfg;
use crate::error::Result;
use crate::ir::{Inst, Operand, SsaId, ValueKind};
use crate::vm::bridge::{ParamKind, SymbolTables};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Infer and stamp a value kind onto every operand of `cfg`.
pub fn infer(cfg: &mut Cfg, tables: &SymbolTables) -> Result<()> {
    let mut solver = Solver::default();

    let mut rounds = 0usize;
    loop {
        let mut changed = false;
        for block in &cfg.blocks {
            for phi in &block.phis {
                changed |= solver.visit(phi, tables)?;
            }
            for inst in &block.instrs {
                changed |= solver.visit(inst, tables)?;
            }
        }
        rounds += 1;
        if !changed {
            break;
        }
    }
    trace!(rounds, values = solver.types.len(), "type inference");

    for block in &mut cfg.blocks {
        for phi in &mut block.phis {
            solver.stamp(phi);
        }
        for inst in &mut block.instrs {
            solver.stamp(inst);
        }
    }
    Ok(())
}

/// Map a marshaling kind onto the VM's value kinds
fn kind_of(param: ParamKind) -> ValueKind {
    match param {
        ParamKind::Bool
        | ParamKind::Int
        | ParamKind::Sbyte
        | ParamKind::Byte
        | ParamKind::Short
        | ParamKind::UShort
        | ParamKind::UInt => ValueKind::Integer,
        ParamKind::Long | ParamKind::ULong => ValueKind::Long,
        ParamKind::Float => ValueKind::Float,
        ParamKind::Double => ValueKind::Double,
        ParamKind::Void => ValueKind::Unknown,
        _ => ValueKind::Object,
    }
}

#[derive(Default)]
struct Solver {
    types: FxHashMap<SsaId, ValueKind>,
}

impl Solver {
    fn get(&self, operand: &Operand) -> ValueKind {
        match operand.ssa_id() {
            Some(id) => self.types.get(&id).copied().unwrap_or(ValueKind::Unknown),
            None => operand.ty,
        }
    }

    /// Merge `kind` into an operand's solution; true if it moved.
    fn merge(&mut self, operand: &Operand, kind: ValueKind) -> bool {
        let Some(id) = operand.ssa_id() else {
            return false;
        };
        let old = self.types.get(&id).copied().unwrap_or(ValueKind::Unknown);
        let new = old.unify(kind);
        if new != old {
            self.types.insert(id, new);
            true
        } else {
            false
        }
    }

    /// One transfer step; true if any solution moved.
    fn visit(&mut self, inst: &Inst, tables: &SymbolTables) -> Result<bool> {
        let mut changed = false;
        match inst {
            Inst::Move { dst, src } => {
                changed |= self.merge(dst, self.get(src));
                changed |= self.merge(src, self.get(dst));
            }
            Inst::Phi { dst, args } => {
                let merged = args
                    .iter()
                    .fold(self.get(dst), |acc, (_, op)| acc.unify(self.get(op)));
                changed |= self.merge(dst, merged);
                for (_, op) in args {
                    changed |= self.merge(op, merged);
                }
            }
            Inst::Unary { dst, src, .. } => {
                changed |= self.merge(dst, self.get(src));
                changed |= self.merge(src, self.get(dst));
            }
            Inst::Binary { dst, lhs, rhs, .. } => {
                let merged = self.get(dst).unify(self.get(lhs)).unify(self.get(rhs));
                changed |= self.merge(dst, merged);
                changed |= self.merge(lhs, merged);
                changed |= self.merge(rhs, merged);
            }
            Inst::Compare { dst, lhs, rhs, .. } => {
                changed |= self.merge(dst, ValueKind::Integer);
                let merged = self.get(lhs).unify(self.get(rhs));
                changed |= self.merge(lhs, merged);
                changed |= self.merge(rhs, merged);
            }
            Inst::Convert { to, dst, .. } => {
                changed |= self.merge(dst, *to);
            }
            Inst::Branch { lhs, rhs, .. } => {
                let merged = self.get(lhs).unify(self.get(rhs));
                changed |= self.merge(lhs, merged);
                changed |= self.merge(rhs, merged);
            }
            Inst::Call { method, args, dst } => {
                let handle = tables.method(method.index)?;
                for (arg, &param) in args.iter().zip(&handle.params) {
                    changed |= self.merge(arg, kind_of(param));
                }
                if let Some(dst) = dst {
                    changed |= self.merge(dst, kind_of(handle.ret));
                }
            }
            Inst::NewObj { ctor, args, dst } => {
                let handle = tables.method(ctor.index)?;
                for (arg, &param) in args.iter().zip(&handle.params) {
                    changed |= self.merge(arg, kind_of(param));
                }
                changed |= self.merge(dst, ValueKind::Object);
            }
            Inst::LoadField { field, obj, dst } => {
                let handle = tables.field(field.index)?;
                changed |= self.merge(obj, ValueKind::Object);
                changed |= self.merge(dst, kind_of(handle.kind));
            }
            Inst::StoreField { field, obj, src } => {
                let handle = tables.field(field.index)?;
                changed |= self.merge(obj, ValueKind::Object);
                changed |= self.merge(src, kind_of(handle.kind));
            }
            Inst::LoadStatic { field, dst } => {
                let handle = tables.field(field.index)?;
                changed |= self.merge(dst, kind_of(handle.kind));
            }
            Inst::StoreStatic { field, src } => {
                let handle = tables.field(field.index)?;
                changed |= self.merge(src, kind_of(handle.kind));
            }
            Inst::Nop | Inst::Jump { .. } | Inst::Ret { .. } => {}
        }
        Ok(changed)
    }

    /// Write the solution back into the instruction's operands.
    fn stamp(&self, inst: &mut Inst) {
        let solved = |types: &FxHashMap<SsaId, ValueKind>, op: &mut Operand| {
            if let Some(id) = op.ssa_id() {
                let kind = types.get(&id).copied().unwrap_or(ValueKind::Unknown);
                op.ty = if kind == ValueKind::Unknown {
                    ValueKind::Integer
                } else {
                    kind
                };
            }
        };
        for op in inst.uses_mut() {
            solved(&self.types, op);
        }
        if let Some(def) = inst.def_mut() {
            solved(&self.types, def);
        }
    }
}
