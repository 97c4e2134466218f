//! Phi resolution: out of SSA form
//!
//! Each predecessor of a join owes the join's phis one parallel copy: all
//! arguments for that predecessor are read simultaneously, then all
//! destinations written. The copies land at the end of the predecessor, or
//! in a fresh block split out of the edge when the predecessor has other
//! successors (copies on a critical edge would execute on paths that never
//! reach the join).
//!
//! Sequentialization uses the ready/pending worklist scheme: a destination
//! that no pending copy still reads can be written immediately; when only
//! cycles remain, one destination is parked in a fresh temporary to break
//! the cycle. Constant sources cannot participate in cycles and are emitted
//! after the register shuffle.

use crate::cfg::{BasicBlock, Cfg};
use crate::error::{Error, Result};
use crate::ir::{Inst, Operand, SsaId, VarKind};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Allocator for compiler temporaries, shared across passes of one method so
/// indices never collide
#[derive(Debug, Default)]
pub struct TmpAlloc {
    next: u32,
}

impl TmpAlloc {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh temporary operand
    pub fn fresh(&mut self) -> Operand {
        let op = Operand::tmp(self.next);
        self.next += 1;
        op
    }
}

/// Replace every phi with explicit copies on the incoming edges.
pub fn resolve(cfg: &mut Cfg, tmps: &mut TmpAlloc) -> Result<()> {
    let join_count = cfg.len();
    let mut splits = 0usize;

    for join in 0..join_count {
        if cfg.blocks[join].phis.is_empty() {
            continue;
        }
        let preds = cfg.blocks[join].preds.clone();
        for pred in preds {
            let mut copies = Vec::new();
            for phi in &cfg.blocks[join].phis {
                let Inst::Phi { dst, args } = phi else { continue };
                let arg = args
                    .iter()
                    .find(|(p, _)| *p == pred)
                    .map(|(_, op)| op.clone())
                    .ok_or_else(|| {
                        Error::InternalError(format!(
                            "phi in block {} has no argument for predecessor {}",
                            join, pred
                        ))
                    })?;
                copies.push((dst.clone(), arg));
            }
            let moves = sequentialize(copies, tmps);
            if moves.is_empty() {
                continue;
            }

            if cfg.blocks[pred].succs.len() > 1 {
                // Critical edge: the copies get their own block on the edge.
                let mut split = BasicBlock {
                    instrs: moves,
                    ..Default::default()
                };
                split.instrs.push(Inst::Jump { target: join });
                let new = cfg.add_block(split);
                cfg.repoint_edge(pred, join, new);
                cfg.blocks[new].succs.push(join);
                cfg.blocks[join].preds.push(new);
                splits += 1;
            } else {
                let at = cfg.blocks[pred].terminator_start();
                cfg.blocks[pred].instrs.splice(at..at, moves);
            }
        }
        cfg.blocks[join].phis.clear();
    }

    if splits > 0 {
        trace!(splits, "critical edges split");
    }
    Ok(())
}

/// Order a parallel copy into sequential moves, breaking cycles with a
/// temporary.
fn sequentialize(copies: Vec<(Operand, Operand)>, tmps: &mut TmpAlloc) -> Vec<Inst> {
    let mut moves = Vec::new();
    let mut tail = Vec::new();

    // (dst, src) pairs whose source is a register; constants go last since
    // they read nothing.
    let mut pending: Vec<(Operand, Operand)> = Vec::new();
    for (dst, src) in copies {
        if dst.ssa_id() == src.ssa_id() && src.is_var() {
            continue;
        }
        if src.is_var() {
            pending.push((dst, src));
        } else {
            tail.push(Inst::Move { dst, src });
        }
    }

    // Current holder of each original source value.
    let mut loc: FxHashMap<SsaId, Operand> = FxHashMap::default();
    for (_, src) in &pending {
        if let Some(id) = src.ssa_id() {
            loc.entry(id).or_insert_with(|| src.clone());
        }
    }

    // A destination is ready once no pending copy still reads it.
    let is_read = |pending: &[(Operand, Operand)], dst: &Operand| {
        pending
            .iter()
            .any(|(_, src)| src.ssa_id() == dst.ssa_id())
    };

    while !pending.is_empty() {
        if let Some(pos) = pending.iter().position(|(dst, _)| !is_read(&pending, dst)) {
            let (dst, src) = pending.remove(pos);
            let from = src
                .ssa_id()
                .and_then(|id| loc.get(&id).cloned())
                .unwrap_or(src);
            moves.push(Inst::Move { dst, src: from });
        } else {
            // Every destination is still read: a register cycle. Park one
            // destination's current value in a temporary and retarget reads.
            let (dst, _) = &pending[0];
            let mut tmp = tmps.fresh();
            tmp.ty = dst.ty;
            moves.push(Inst::Move {
                dst: tmp.clone(),
                src: dst.clone(),
            });
            if let Some(id) = dst.ssa_id() {
                loc.insert(id, tmp);
            }
            let (dst, src) = pending.remove(0);
            let from = src
                .ssa_id()
                .and_then(|id| loc.get(&id).cloned())
                .unwrap_or(src);
            moves.push(Inst::Move { dst, src: from });
        }
    }

    moves.extend(tail);
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ConstValue;

    fn apply(copies: Vec<(Operand, Operand)>) -> Vec<Inst> {
        sequentialize(copies, &mut TmpAlloc::new())
    }

    fn versioned(mut op: Operand, version: i32) -> Operand {
        op.version = version;
        op
    }

    #[test]
    fn test_independent_copies() {
        let moves = apply(vec![
            (versioned(Operand::local(0), 2), versioned(Operand::stack(0), 1)),
            (versioned(Operand::local(1), 2), versioned(Operand::stack(1), 1)),
        ]);
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|m| matches!(m, Inst::Move { .. })));
    }

    #[test]
    fn test_chain_ordering() {
        // b <- a, c <- b: c must read b's old value first.
        let a = versioned(Operand::local(0), 1);
        let b = versioned(Operand::local(1), 1);
        let c = versioned(Operand::local(2), 1);
        let moves = apply(vec![(b.clone(), a.clone()), (c.clone(), b.clone())]);
        assert_eq!(
            moves,
            vec![
                Inst::Move {
                    dst: c,
                    src: b.clone()
                },
                Inst::Move { dst: b, src: a },
            ]
        );
    }

    #[test]
    fn test_swap_uses_temporary() {
        let a = versioned(Operand::local(0), 1);
        let b = versioned(Operand::local(1), 1);
        let moves = apply(vec![(a.clone(), b.clone()), (b.clone(), a.clone())]);
        // tmp <- a; a <- b; b <- tmp
        assert_eq!(moves.len(), 3);
        let Inst::Move { dst, src } = &moves[0] else {
            panic!("expected move");
        };
        assert_eq!(dst.kind, VarKind::Tmp);
        assert!(src.same_var(&a));
        let Inst::Move { dst, src } = &moves[2] else {
            panic!("expected move");
        };
        assert!(dst.same_var(&b));
        assert_eq!(src.kind, VarKind::Tmp);
    }

    #[test]
    fn test_constants_emitted_last() {
        let a = versioned(Operand::local(0), 1);
        let b = versioned(Operand::local(1), 1);
        let moves = apply(vec![
            (a.clone(), Operand::konst(ConstValue::I32(1))),
            (b, a),
        ]);
        // b reads a before the constant overwrites it.
        assert_eq!(moves.len(), 2);
        let Inst::Move { src, .. } = &moves[0] else {
            panic!("expected move");
        };
        assert!(src.is_var());
        let Inst::Move { src, .. } = &moves[1] else {
            panic!("expected move");
        };
        assert!(src.is_const());
    }

    #[test]
    fn test_self_copy_elided() {
        let a = versioned(Operand::local(0), 1);
        let moves = apply(vec![(a.clone(), a)]);
        assert!(moves.is_empty());
    }
}
