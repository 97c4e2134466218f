//! Control-flow recovery and unstacking
//!
//! One walk over the source instruction stream recovers basic-block
//! boundaries (leader algorithm) and rewrites every stack-based opcode into
//! an operand-based abstract instruction. The running stack depth acts as an
//! implicit operand numbering scheme: an operation popping N slots consumes
//! `Stack(depth-1) .. Stack(depth-N)` and a push defines `Stack(depth)` after
//! the pops. The stack becomes a bank of numbered pseudo-registers, so later
//! dataflow passes treat its slots uniformly with locals and arguments.
//!
//! Code unreachable from the entry (dead stretches after an unconditional
//! transfer that nothing targets) has no defined entry depth and is dropped
//! here rather than carried through the pipeline.

use crate::cfg::{BasicBlock, Cfg};
use crate::error::{Error, Result};
use crate::il::{IlOp, MethodBody};
use crate::ir::{BinaryOp, Cond, ConstValue, Inst, Operand, UnaryOp, ValueKind};
use crate::vm::bridge::SymbolTables;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tracing::trace;

/// Lift a method body into a control-flow graph of abstract instructions
pub fn lift(body: &MethodBody, tables: &SymbolTables) -> Result<Cfg> {
    if body.instructions.is_empty() {
        return Err(Error::InternalError("empty method body".into()));
    }

    let ranges = block_ranges(body);
    let block_at = |offset: usize| -> Result<usize> {
        ranges
            .iter()
            .position(|&(start, end)| offset >= start && offset < end)
            .filter(|_| ranges.iter().any(|&(start, _)| start == offset))
            .ok_or_else(|| {
                Error::InternalError(format!("branch into the middle of a block at {}", offset))
            })
    };

    // Translate blocks breadth-first from the entry so every translated block
    // has a known entry stack depth.
    let mut lifted: Vec<Option<BasicBlock>> = vec![None; ranges.len()];
    let mut entry_depth: Vec<Option<usize>> = vec![None; ranges.len()];
    let mut queue = VecDeque::new();
    entry_depth[0] = Some(0);
    queue.push_back(0usize);

    while let Some(p) = queue.pop_front() {
        if lifted[p].is_some() {
            continue;
        }
        let depth = entry_depth[p].ok_or_else(|| {
            Error::InternalError(format!("block at {} queued without an entry depth", ranges[p].0))
        })?;
        let (start, end) = ranges[p];
        let (block, exits) = translate_block(body, tables, start, end, depth, &ranges, &block_at)?;
        for &(succ, succ_depth) in &exits {
            match entry_depth[succ] {
                None => {
                    entry_depth[succ] = Some(succ_depth);
                    queue.push_back(succ);
                }
                Some(existing) if existing != succ_depth => {
                    return Err(Error::InternalError(format!(
                        "inconsistent stack depth at instruction {}: {} vs {}",
                        ranges[succ].0, existing, succ_depth
                    )));
                }
                Some(_) => queue.push_back(succ),
            }
        }
        lifted[p] = Some(block);
    }

    // Compact: drop never-translated (unreachable) blocks and remap indices.
    let mut remap: FxHashMap<usize, usize> = FxHashMap::default();
    let mut cfg = Cfg {
        arg_count: body.arg_count,
        local_count: body.local_count,
        ..Default::default()
    };
    for (p, block) in lifted.iter().enumerate() {
        if block.is_some() {
            remap.insert(p, remap.len());
        }
    }
    for block in lifted.into_iter().flatten() {
        let mut block = block;
        let term_start = block.terminator_start();
        for inst in &mut block.instrs[term_start..] {
            if let Inst::Jump { target } | Inst::Branch { target, .. } = inst {
                *target = remap[target];
            }
        }
        cfg.add_block(block);
    }

    // Successor and predecessor edges come from the explicit terminators.
    for i in 0..cfg.len() {
        let targets: Vec<usize> = {
            let block = &cfg.blocks[i];
            block.instrs[block.terminator_start()..]
                .iter()
                .flat_map(|inst| inst.targets())
                .collect()
        };
        for target in targets {
            cfg.add_edge(i, target);
        }
    }

    trace!(blocks = cfg.len(), insts = cfg.inst_count(), "lifted method");
    Ok(cfg)
}

/// Leader set: the first instruction, every branch target, and every
/// instruction immediately following a control transfer. Blocks are the
/// maximal runs between consecutive leaders.
fn block_ranges(body: &MethodBody) -> Vec<(usize, usize)> {
    let count = body.instructions.len();
    let mut leader = vec![false; count];
    leader[0] = true;
    for inst in &body.instructions {
        if let Some(target) = inst.op.branch_target() {
            if target < count {
                leader[target] = true;
            }
        }
        if inst.op.is_control_transfer() && inst.offset + 1 < count {
            leader[inst.offset + 1] = true;
        }
    }

    let mut ranges = Vec::new();
    let mut start = 0;
    for offset in 1..count {
        if leader[offset] {
            ranges.push((start, offset));
            start = offset;
        }
    }
    ranges.push((start, count));
    ranges
}

type Exits = Vec<(usize, usize)>;

/// Translate one block's instruction range given its entry stack depth.
///
/// Returns the block and its `(successor, entry depth)` pairs. The block ends
/// with an explicit terminator run; a conditional branch is followed by the
/// jump that carries its fallthrough edge.
fn translate_block(
    body: &MethodBody,
    tables: &SymbolTables,
    start: usize,
    end: usize,
    entry_depth: usize,
    ranges: &[(usize, usize)],
    block_at: &dyn Fn(usize) -> Result<usize>,
) -> Result<(BasicBlock, Exits)> {
    let mut block = BasicBlock {
        start,
        end,
        live_in_stack: entry_depth,
        ..Default::default()
    };
    let mut depth = entry_depth;
    let mut exits = Vec::new();
    let mut terminated = false;

    // Stack operand helpers relative to the current depth.
    let pop = |depth: &mut usize| -> Result<Operand> {
        if *depth == 0 {
            return Err(Error::InternalError(format!(
                "operand stack underflow in block at {}",
                start
            )));
        }
        *depth -= 1;
        Ok(Operand::stack(*depth as u32))
    };
    let push = |depth: &mut usize| -> Operand {
        let op = Operand::stack(*depth as u32);
        *depth += 1;
        op
    };

    for inst in &body.instructions[start..end] {
        let offset = inst.offset;
        match &inst.op {
            IlOp::LdArg(n) => {
                let dst = push(&mut depth);
                block.instrs.push(Inst::Move {
                    dst,
                    src: Operand::arg(*n as u32),
                });
            }
            IlOp::LdLoc(n) => {
                let dst = push(&mut depth);
                block.instrs.push(Inst::Move {
                    dst,
                    src: Operand::local(*n as u32),
                });
            }
            IlOp::StLoc(n) => {
                let src = pop(&mut depth)?;
                block.instrs.push(Inst::Move {
                    dst: Operand::local(*n as u32),
                    src,
                });
            }
            IlOp::LdcI4(v) => {
                let dst = push(&mut depth);
                block.instrs.push(Inst::Move {
                    dst,
                    src: Operand::konst(ConstValue::I32(*v)),
                });
            }
            IlOp::LdcI8(v) => {
                let dst = push(&mut depth);
                block.instrs.push(Inst::Move {
                    dst,
                    src: Operand::konst(ConstValue::I64(*v)),
                });
            }
            IlOp::LdcR4(v) => {
                let dst = push(&mut depth);
                block.instrs.push(Inst::Move {
                    dst,
                    src: Operand::konst(ConstValue::F32(*v)),
                });
            }
            IlOp::LdcR8(v) => {
                let dst = push(&mut depth);
                block.instrs.push(Inst::Move {
                    dst,
                    src: Operand::konst(ConstValue::F64(*v)),
                });
            }
            IlOp::LdNull => {
                let dst = push(&mut depth);
                block.instrs.push(Inst::Move {
                    dst,
                    src: Operand::konst(ConstValue::Null),
                });
            }
            IlOp::Dup => {
                let src = pop(&mut depth)?;
                push(&mut depth);
                let dst = push(&mut depth);
                block.instrs.push(Inst::Move { dst, src });
            }
            IlOp::Pop => {
                pop(&mut depth)?;
            }
            IlOp::Add
            | IlOp::Sub
            | IlOp::Mul
            | IlOp::Div
            | IlOp::Rem
            | IlOp::And
            | IlOp::Or
            | IlOp::Xor
            | IlOp::Shl
            | IlOp::Shr
            | IlOp::AddOvf
            | IlOp::SubOvf
            | IlOp::MulOvf => {
                let rhs = pop(&mut depth)?;
                let lhs = pop(&mut depth)?;
                let dst = push(&mut depth);
                let (op, checked) = match inst.op {
                    IlOp::Add => (BinaryOp::Add, false),
                    IlOp::Sub => (BinaryOp::Sub, false),
                    IlOp::Mul => (BinaryOp::Mul, false),
                    IlOp::Div => (BinaryOp::Div, false),
                    IlOp::Rem => (BinaryOp::Rem, false),
                    IlOp::And => (BinaryOp::And, false),
                    IlOp::Or => (BinaryOp::Or, false),
                    IlOp::Xor => (BinaryOp::Xor, false),
                    IlOp::Shl => (BinaryOp::Shl, false),
                    IlOp::Shr => (BinaryOp::Shr, false),
                    IlOp::AddOvf => (BinaryOp::Add, true),
                    IlOp::SubOvf => (BinaryOp::Sub, true),
                    IlOp::MulOvf => (BinaryOp::Mul, true),
                    _ => unreachable!(),
                };
                block.instrs.push(Inst::Binary {
                    op,
                    checked,
                    dst,
                    lhs,
                    rhs,
                });
            }
            IlOp::Neg | IlOp::Not => {
                let src = pop(&mut depth)?;
                let dst = push(&mut depth);
                let op = if inst.op == IlOp::Neg {
                    UnaryOp::Neg
                } else {
                    UnaryOp::Not
                };
                block.instrs.push(Inst::Unary { op, dst, src });
            }
            IlOp::Ceq | IlOp::Cgt | IlOp::Clt => {
                let rhs = pop(&mut depth)?;
                let lhs = pop(&mut depth)?;
                let dst = push(&mut depth);
                let cond = match inst.op {
                    IlOp::Ceq => Cond::Eq,
                    IlOp::Cgt => Cond::Gt,
                    _ => Cond::Lt,
                };
                block.instrs.push(Inst::Compare {
                    cond,
                    dst,
                    lhs,
                    rhs,
                });
            }
            IlOp::ConvI4 | IlOp::ConvI8 | IlOp::ConvR4 | IlOp::ConvR8 => {
                let src = pop(&mut depth)?;
                let dst = push(&mut depth);
                let to = match inst.op {
                    IlOp::ConvI4 => ValueKind::Integer,
                    IlOp::ConvI8 => ValueKind::Long,
                    IlOp::ConvR4 => ValueKind::Float,
                    _ => ValueKind::Double,
                };
                block.instrs.push(Inst::Convert { to, dst, src });
            }
            IlOp::Br(target) => {
                let target = block_at(*target)?;
                block.instrs.push(Inst::Jump { target });
                exits.push((target, depth));
                terminated = true;
            }
            IlOp::BrTrue(target) | IlOp::BrFalse(target) => {
                let src = pop(&mut depth)?;
                let cond = if matches!(inst.op, IlOp::BrTrue(_)) {
                    Cond::Ne
                } else {
                    Cond::Eq
                };
                let target = block_at(*target)?;
                push_conditional(
                    &mut block,
                    &mut exits,
                    cond,
                    src,
                    Operand::konst(ConstValue::I32(0)),
                    target,
                    fallthrough(ranges, end, offset)?,
                    depth,
                );
                terminated = true;
            }
            IlOp::Beq(t) | IlOp::Bne(t) | IlOp::Blt(t) | IlOp::Ble(t) | IlOp::Bgt(t)
            | IlOp::Bge(t) => {
                let rhs = pop(&mut depth)?;
                let lhs = pop(&mut depth)?;
                let cond = match inst.op {
                    IlOp::Beq(_) => Cond::Eq,
                    IlOp::Bne(_) => Cond::Ne,
                    IlOp::Blt(_) => Cond::Lt,
                    IlOp::Ble(_) => Cond::Le,
                    IlOp::Bgt(_) => Cond::Gt,
                    _ => Cond::Ge,
                };
                let target = block_at(*t)?;
                push_conditional(
                    &mut block,
                    &mut exits,
                    cond,
                    lhs,
                    rhs,
                    target,
                    fallthrough(ranges, end, offset)?,
                    depth,
                );
                terminated = true;
            }
            IlOp::Ret => {
                let src = if body.is_void() {
                    None
                } else {
                    Some(pop(&mut depth)?)
                };
                block.instrs.push(Inst::Ret { src });
                terminated = true;
            }
            IlOp::Call(index) => {
                let method = tables.method(*index)?;
                let mut args = Vec::with_capacity(method.params.len());
                for _ in 0..method.params.len() {
                    args.push(pop(&mut depth)?);
                }
                args.reverse();
                let dst = method.returns_value().then(|| push(&mut depth));
                block.instrs.push(Inst::Call {
                    method: Operand::meta(*index),
                    args,
                    dst,
                });
            }
            IlOp::NewObj(index) => {
                let ctor = tables.method(*index)?;
                let mut args = Vec::with_capacity(ctor.params.len());
                for _ in 0..ctor.params.len() {
                    args.push(pop(&mut depth)?);
                }
                args.reverse();
                let dst = push(&mut depth);
                block.instrs.push(Inst::NewObj {
                    ctor: Operand::meta(*index),
                    args,
                    dst,
                });
            }
            IlOp::LdFld(index) => {
                let obj = pop(&mut depth)?;
                let dst = push(&mut depth);
                block.instrs.push(Inst::LoadField {
                    field: Operand::meta(*index),
                    obj,
                    dst,
                });
            }
            IlOp::StFld(index) => {
                let src = pop(&mut depth)?;
                let obj = pop(&mut depth)?;
                block.instrs.push(Inst::StoreField {
                    field: Operand::meta(*index),
                    obj,
                    src,
                });
            }
            IlOp::LdsFld(index) => {
                let dst = push(&mut depth);
                block.instrs.push(Inst::LoadStatic {
                    field: Operand::meta(*index),
                    dst,
                });
            }
            IlOp::StsFld(index) => {
                let src = pop(&mut depth)?;
                block.instrs.push(Inst::StoreStatic {
                    field: Operand::meta(*index),
                    src,
                });
            }
            IlOp::Unsupported(name) => {
                return Err(Error::unsupported_opcode(name, offset));
            }
        }
    }

    if !terminated {
        // Implicit fallthrough into the next block becomes an explicit jump.
        let target = fallthrough(ranges, end, end.saturating_sub(1))?;
        block.instrs.push(Inst::Jump { target });
        exits.push((target, depth));
    }

    Ok((block, exits))
}

/// The block starting at source offset `end` (the fallthrough successor)
fn fallthrough(ranges: &[(usize, usize)], end: usize, at: usize) -> Result<usize> {
    ranges
        .iter()
        .position(|&(start, _)| start == end)
        .ok_or_else(|| {
            Error::InternalError(format!("control falls off the end of the method at {}", at))
        })
}

/// Emit a conditional branch plus its explicit fallthrough jump.
///
/// A branch whose target and fallthrough coincide degenerates to a jump; this
/// also keeps duplicate edges out of the graph, which phi operands (keyed by
/// predecessor block) could not distinguish.
#[allow(clippy::too_many_arguments)]
fn push_conditional(
    block: &mut BasicBlock,
    exits: &mut Exits,
    cond: Cond,
    lhs: Operand,
    rhs: Operand,
    target: usize,
    fall: usize,
    depth: usize,
) {
    if target == fall {
        block.instrs.push(Inst::Jump { target });
        exits.push((target, depth));
        return;
    }
    block.instrs.push(Inst::Branch {
        cond,
        lhs,
        rhs,
        target,
    });
    block.instrs.push(Inst::Jump { target: fall });
    exits.push((target, depth));
    exits.push((fall, depth));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::parse_method;

    fn lift_source(source: &str) -> Cfg {
        let tables = SymbolTables::new();
        let body = parse_method(source, &tables).unwrap();
        lift(&body, &tables).unwrap()
    }

    #[test]
    fn test_straightline_single_block() {
        let cfg = lift_source(".method add2 args=2 locals=0\nldarg 0\nldarg 1\nadd\nret\n");
        assert_eq!(cfg.len(), 1);
        let block = &cfg.blocks[0];
        assert_eq!(block.live_in_stack, 0);
        assert!(matches!(block.instrs[2], Inst::Binary { .. }));
        assert!(matches!(block.instrs[3], Inst::Ret { src: Some(_) }));
    }

    #[test]
    fn test_stack_slots_number_by_depth() {
        let cfg = lift_source(".method add2 args=2 locals=0\nldarg 0\nldarg 1\nadd\nret\n");
        let block = &cfg.blocks[0];
        // ldarg 0 -> s0, ldarg 1 -> s1, add -> s0 = s0 + s1
        let Inst::Binary { dst, lhs, rhs, .. } = &block.instrs[2] else {
            panic!("expected binary");
        };
        assert_eq!((dst.index, lhs.index, rhs.index), (0, 0, 1));
    }

    #[test]
    fn test_diamond_blocks_and_edges() {
        let cfg = lift_source(
            ".method max2 args=2 locals=0\n\
             ldarg 0\nldarg 1\nbge use_a\n\
             ldarg 1\nret\n\
             use_a:\nldarg 0\nret\n",
        );
        assert_eq!(cfg.len(), 3);
        assert_eq!(cfg.blocks[0].succs.len(), 2);
        assert!(cfg.blocks[0].succs.contains(&1));
        assert!(cfg.blocks[0].succs.contains(&2));
        assert_eq!(cfg.blocks[1].preds, vec![0]);
        assert_eq!(cfg.blocks[2].preds, vec![0]);
    }

    #[test]
    fn test_branch_operand_depth() {
        let cfg = lift_source(
            ".method f args=1 locals=0\n\
             ldarg 0\nbrtrue yes\n\
             ldc.i4 0\nret\n\
             yes:\nldc.i4 1\nret\n",
        );
        let Inst::Branch { lhs, rhs, .. } = &cfg.blocks[0].instrs[1] else {
            panic!("expected branch");
        };
        assert_eq!(lhs.index, 0);
        assert!(rhs.is_const());
    }

    #[test]
    fn test_live_in_stack_across_edges() {
        // A value is on the stack across the join: the join block starts at depth 1.
        let cfg = lift_source(
            ".method pick args=1 locals=0\n\
             ldc.i4 10\n\
             ldarg 0\nbrtrue join\n\
             join:\nret\n",
        );
        let join = cfg.len() - 1;
        assert_eq!(cfg.blocks[join].live_in_stack, 1);
    }

    #[test]
    fn test_unreachable_code_dropped() {
        let cfg = lift_source(
            ".method f args=0 locals=0\n\
             ldc.i4 1\nret\n\
             ldc.i4 2\nret\n",
        );
        assert_eq!(cfg.len(), 1);
    }

    #[test]
    fn test_unsupported_opcode_is_fatal() {
        let tables = SymbolTables::new();
        let mut body = MethodBody::new("bad", 0, 0);
        body.push(IlOp::Unsupported("calli".into()));
        body.push(IlOp::Ret);
        let err = lift(&body, &tables).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOpcode { .. }));
    }
}
