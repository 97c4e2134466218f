//! Copy propagation on SSA form
//!
//! Every `Move` defines an SSA value that is just another name for its
//! source, so uses of the destination can read the source directly. Chains
//! collapse transitively (a copy of a copy reads the original), constants
//! propagate the same way as variables, and moves whose destination ends up
//! unused become nops for the driver to filter.
//!
//! SSA makes this safe without any availability analysis: a value has one
//! definition and never changes, so a substitution is valid at every use,
//! including phi operands in other blocks.

use crate::cfg::Cfg;
use crate::ir::{Inst, Operand, SsaId};
use rustc_hash::{FxHashMap, FxHashSet};

/// Propagate copies and kill dead moves; returns how many moves died.
pub fn run(cfg: &mut Cfg) -> usize {
    // Copy destinations mapped to their (chain-resolved) sources.
    let mut subst: FxHashMap<SsaId, Operand> = FxHashMap::default();
    for block in &cfg.blocks {
        for inst in &block.instrs {
            if let Inst::Move { dst, src } = inst {
                if let Some(id) = dst.ssa_id() {
                    subst.insert(id, src.clone());
                }
            }
        }
    }
    for id in subst.keys().copied().collect::<Vec<_>>() {
        let mut root = subst[&id].clone();
        let mut hops = 0;
        while let Some(next) = root.ssa_id().and_then(|r| subst.get(&r)) {
            root = next.clone();
            hops += 1;
            if hops > subst.len() {
                break; // self-referential move, leave as-is
            }
        }
        subst.insert(id, root);
    }

    let replace = |op: &mut Operand| {
        if let Some(resolved) = op.ssa_id().and_then(|id| subst.get(&id)) {
            *op = resolved.clone();
        }
    };
    for block in &mut cfg.blocks {
        for phi in &mut block.phis {
            for op in phi.uses_mut() {
                replace(op);
            }
        }
        for inst in &mut block.instrs {
            for op in inst.uses_mut() {
                replace(op);
            }
        }
    }

    // A move is dead once nothing reads its destination.
    let mut live: FxHashSet<SsaId> = FxHashSet::default();
    for block in &cfg.blocks {
        for inst in block.phis.iter().chain(&block.instrs) {
            for op in inst.uses() {
                if let Some(id) = op.ssa_id() {
                    live.insert(id);
                }
            }
        }
    }
    let mut killed = 0;
    for block in &mut cfg.blocks {
        for inst in &mut block.instrs {
            let dead = matches!(
                inst,
                Inst::Move { dst, .. } if dst.ssa_id().is_some_and(|id| !live.contains(&id))
            );
            if dead {
                *inst = Inst::Nop;
                killed += 1;
            }
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::DomTree;
    use crate::il::parse_method;
    use crate::lift::lift;
    use crate::ssa::construct_ssa;
    use crate::vm::bridge::SymbolTables;

    fn propagated(source: &str) -> Cfg {
        let tables = SymbolTables::new();
        let body = parse_method(source, &tables).unwrap();
        let mut cfg = lift(&body, &tables).unwrap();
        let dom = DomTree::build(&cfg);
        construct_ssa(&mut cfg, &dom).unwrap();
        run(&mut cfg);
        cfg
    }

    #[test]
    fn test_add_reads_args_directly() {
        let cfg = propagated(".method add2 args=2 locals=0\nldarg 0\nldarg 1\nadd\nret\n");
        let block = &cfg.blocks[0];
        let Inst::Binary { lhs, rhs, .. } = block
            .instrs
            .iter()
            .find(|i| matches!(i, Inst::Binary { .. }))
            .unwrap()
        else {
            unreachable!();
        };
        assert_eq!(lhs.kind, crate::ir::VarKind::Arg);
        assert_eq!(rhs.kind, crate::ir::VarKind::Arg);
        // Both argument-loading moves are dead now.
        let nops = block.instrs.iter().filter(|i| **i == Inst::Nop).count();
        assert_eq!(nops, 2);
    }

    #[test]
    fn test_copy_chain_collapses() {
        // arg -> local -> stack -> ret reads the argument.
        let cfg = propagated(
            ".method f args=1 locals=1\nldarg 0\nstloc 0\nldloc 0\nret\n",
        );
        let Inst::Ret { src: Some(src) } = cfg.blocks[0].instrs.last().unwrap() else {
            panic!("expected ret");
        };
        assert_eq!(src.kind, crate::ir::VarKind::Arg);
        assert_eq!(src.index, 0);
    }

    #[test]
    fn test_constant_propagates() {
        let cfg = propagated(".method f args=0 locals=0\nldc.i4 7\nret\n");
        let Inst::Ret { src: Some(src) } = cfg.blocks[0].instrs.last().unwrap() else {
            panic!("expected ret");
        };
        assert!(src.is_const());
    }

    #[test]
    fn test_phi_arguments_substituted() {
        let cfg = propagated(
            ".method f args=1 locals=0\n\
             ldarg 0\nbrtrue b\n\
             ldc.i4 1\nbr done\n\
             b:\nldc.i4 2\n\
             done:\nret\n",
        );
        let join = cfg
            .blocks
            .iter()
            .position(|b| !b.phis.is_empty())
            .expect("join with phi");
        let Inst::Phi { args, .. } = &cfg.blocks[join].phis[0] else {
            panic!("expected phi");
        };
        assert!(args.iter().all(|(_, op)| op.is_const()));
    }
}
