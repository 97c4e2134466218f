//! SSA construction
//!
//! Phi placement by iterated dominance frontiers followed by version-stack
//! renaming over the dominator tree. Arguments and locals are defined on
//! entry (the call sets arguments, locals are zero-initialized), so both are
//! seeded with version 0 before renaming. Stack slots carry one exception:
//! a phi for slot `k` is only placed at a join whose entry stack depth
//! exceeds `k`, since a slot below the entry depth holds no value on that
//! path and a phi for it would merge garbage.
//!
//! Phi operands are keyed by predecessor block index, which is why the graph
//! never carries duplicate edges (a two-way branch to the same block is
//! normalized to a jump during lifting).

use crate::cfg::Cfg;
use crate::dom::DomTree;
use crate::error::{Error, Result};
use crate::ir::{Inst, Operand, VarId, VarKind};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

/// Rewrite `cfg` into SSA form in place.
pub fn construct_ssa(cfg: &mut Cfg, dom: &DomTree) -> Result<()> {
    place_phis(cfg, dom);
    Renamer::new(cfg).run(cfg, dom)?;
    trace!(
        phis = cfg.blocks.iter().map(|b| b.phis.len()).sum::<usize>(),
        "ssa constructed"
    );
    Ok(())
}

/// Insert phis at the iterated dominance frontier of each variable's
/// definition blocks.
fn place_phis(cfg: &mut Cfg, dom: &DomTree) {
    let mut def_blocks: FxHashMap<VarId, Vec<usize>> = FxHashMap::default();
    for (index, block) in cfg.blocks.iter().enumerate() {
        for inst in &block.instrs {
            if let Some(var) = inst.def().and_then(|d| d.var_id()) {
                def_blocks.entry(var).or_default().push(index);
            }
        }
    }

    let mut vars: Vec<VarId> = def_blocks.keys().copied().collect();
    vars.sort_unstable();

    for var in vars {
        let mut worklist = def_blocks[&var].clone();
        let mut placed: FxHashSet<usize> = FxHashSet::default();
        while let Some(block) = worklist.pop() {
            for &join in &dom.frontier[block] {
                if !placed.insert(join) || !phi_allowed(cfg, var, join) {
                    continue;
                }
                let args = cfg.blocks[join]
                    .preds
                    .iter()
                    .map(|&pred| (pred, Operand::from_id(var)))
                    .collect();
                cfg.blocks[join].phis.push(Inst::Phi {
                    dst: Operand::from_id(var),
                    args,
                });
                // The phi is itself a definition; iterate.
                if !def_blocks[&var].contains(&join) {
                    worklist.push(join);
                }
            }
        }
    }
}

/// Arguments and locals are defined on every path; a stack slot only exists
/// at a join when the entry depth covers it.
fn phi_allowed(cfg: &Cfg, var: VarId, join: usize) -> bool {
    match var.kind {
        VarKind::Stack => (var.index as usize) < cfg.blocks[join].live_in_stack,
        _ => true,
    }
}

/// Version-stack renaming state
struct Renamer {
    stacks: FxHashMap<VarId, Vec<i32>>,
    counters: FxHashMap<VarId, i32>,
}

impl Renamer {
    /// Seed arguments and locals with version 0 (defined on method entry).
    fn new(cfg: &Cfg) -> Self {
        let mut stacks: FxHashMap<VarId, Vec<i32>> = FxHashMap::default();
        let mut counters: FxHashMap<VarId, i32> = FxHashMap::default();
        for index in 0..cfg.arg_count {
            let var = VarId {
                kind: VarKind::Arg,
                index: index as u32,
            };
            stacks.insert(var, vec![0]);
            counters.insert(var, 1);
        }
        for index in 0..cfg.local_count {
            let var = VarId {
                kind: VarKind::Local,
                index: index as u32,
            };
            stacks.insert(var, vec![0]);
            counters.insert(var, 1);
        }
        Renamer { stacks, counters }
    }

    fn run(&mut self, cfg: &mut Cfg, dom: &DomTree) -> Result<()> {
        // Dominator-tree DFS with explicit enter/exit actions so version
        // stacks unwind exactly when a subtree is done.
        enum Action {
            Enter(usize),
            Exit(Vec<VarId>),
        }
        let mut stack = vec![Action::Enter(0)];
        while let Some(action) = stack.pop() {
            match action {
                Action::Enter(block) => {
                    let pushed = self.rename_block(cfg, block)?;
                    stack.push(Action::Exit(pushed));
                    for &child in dom.children[block].iter().rev() {
                        stack.push(Action::Enter(child));
                    }
                }
                Action::Exit(pushed) => {
                    for var in pushed {
                        if let Some(versions) = self.stacks.get_mut(&var) {
                            versions.pop();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Rename one block; returns the variables whose stacks grew here.
    fn rename_block(&mut self, cfg: &mut Cfg, block: usize) -> Result<Vec<VarId>> {
        let mut pushed = Vec::new();

        // Phi destinations are definitions at the top of the block.
        for phi in &mut cfg.blocks[block].phis {
            if let Inst::Phi { dst, .. } = phi {
                self.define(dst, &mut pushed);
            }
        }

        for inst in &mut cfg.blocks[block].instrs {
            for operand in inst.uses_mut() {
                self.use_current(operand, block)?;
            }
            if let Some(def) = inst.def_mut() {
                self.define(def, &mut pushed);
            }
        }

        // Fill this block's slot in each successor's phis.
        let succs = cfg.blocks[block].succs.clone();
        for succ in succs {
            for phi in &mut cfg.blocks[succ].phis {
                let Inst::Phi { args, .. } = phi else { continue };
                for (pred, operand) in args.iter_mut() {
                    if *pred == block {
                        self.use_current(operand, block)?;
                    }
                }
            }
        }

        Ok(pushed)
    }

    fn define(&mut self, operand: &mut Operand, pushed: &mut Vec<VarId>) {
        let Some(var) = operand.var_id() else { return };
        let counter = self.counters.entry(var).or_insert(0);
        let version = *counter;
        *counter += 1;
        self.stacks.entry(var).or_default().push(version);
        pushed.push(var);
        operand.version = version;
    }

    fn use_current(&self, operand: &mut Operand, block: usize) -> Result<()> {
        let Some(var) = operand.var_id() else {
            return Ok(());
        };
        let version = self
            .stacks
            .get(&var)
            .and_then(|versions| versions.last())
            .copied()
            .ok_or_else(|| {
                Error::InternalError(format!("use of undefined {:?} in block {}", var, block))
            })?;
        operand.version = version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::parse_method;
    use crate::lift::lift;
    use crate::vm::bridge::SymbolTables;

    fn ssa_of(source: &str) -> Cfg {
        let tables = SymbolTables::new();
        let body = parse_method(source, &tables).unwrap();
        let mut cfg = lift(&body, &tables).unwrap();
        let dom = DomTree::build(&cfg);
        construct_ssa(&mut cfg, &dom).unwrap();
        cfg
    }

    #[test]
    fn test_straightline_versions() {
        let cfg = ssa_of(
            ".method f args=1 locals=1\n\
             ldarg 0\nstloc 0\n\
             ldloc 0\nldc.i4 1\nadd\nstloc 0\n\
             ldloc 0\nret\n",
        );
        let block = &cfg.blocks[0];
        // stloc 0 twice: versions 1 then 2, final read sees 2.
        let defs: Vec<i32> = block
            .instrs
            .iter()
            .filter_map(|i| i.def())
            .filter(|d| d.kind == VarKind::Local)
            .map(|d| d.version)
            .collect();
        assert_eq!(defs, vec![1, 2]);
        let Inst::Ret { src: Some(src) } = block.instrs.last().unwrap() else {
            panic!("expected ret");
        };
        assert_eq!(src.version, 2);
    }

    #[test]
    fn test_local_phi_at_join() {
        let cfg = ssa_of(
            ".method f args=1 locals=1\n\
             ldarg 0\nbrtrue set\n\
             ldc.i4 1\nstloc 0\nbr done\n\
             set:\nldc.i4 2\nstloc 0\n\
             done:\nldloc 0\nret\n",
        );
        let join = cfg
            .blocks
            .iter()
            .position(|b| !b.phis.is_empty())
            .expect("a join with a phi");
        let Inst::Phi { dst, args } = &cfg.blocks[join].phis[0] else {
            panic!("expected phi");
        };
        assert_eq!(dst.kind, VarKind::Local);
        assert_eq!(args.len(), 2);
        // Both incoming versions differ and neither equals the merged one.
        assert_ne!(args[0].1.version, args[1].1.version);
        assert_ne!(dst.version, args[0].1.version);
    }

    #[test]
    fn test_stack_slot_phi_when_live() {
        // A value left on the stack across the join gets a stack-slot phi.
        let cfg = ssa_of(
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
            .expect("a join with a phi");
        let Inst::Phi { dst, .. } = &cfg.blocks[join].phis[0] else {
            panic!("expected phi");
        };
        assert_eq!(dst.kind, VarKind::Stack);
        assert_eq!(cfg.blocks[join].live_in_stack, 1);
    }

    #[test]
    fn test_dead_stack_slot_gets_no_phi() {
        // Both sides compute and consume their own temporaries; the join
        // starts at depth 0, so no stack phi exists.
        let cfg = ssa_of(
            ".method f args=1 locals=1\n\
             ldarg 0\nbrtrue b\n\
             ldc.i4 1\nstloc 0\nbr done\n\
             b:\nldc.i4 2\nstloc 0\n\
             done:\nldloc 0\nret\n",
        );
        for block in &cfg.blocks {
            for phi in &block.phis {
                let Inst::Phi { dst, .. } = phi else { continue };
                assert_ne!(dst.kind, VarKind::Stack);
            }
        }
    }

    #[test]
    fn test_loop_header_phi() {
        let cfg = ssa_of(
            ".method count args=1 locals=1\n\
             ldarg 0\nstloc 0\n\
             top:\n\
             ldloc 0\nldc.i4 0\nble done\n\
             ldloc 0\nldc.i4 1\nsub\nstloc 0\n\
             br top\n\
             done:\nldloc 0\nret\n",
        );
        // The loop header merges the entry definition with the decrement.
        let header = cfg
            .blocks
            .iter()
            .position(|b| b.preds.len() == 2 && !b.phis.is_empty())
            .expect("loop header with a phi");
        let Inst::Phi { dst, args } = &cfg.blocks[header].phis[0] else {
            panic!("expected phi");
        };
        assert_eq!(dst.kind, VarKind::Local);
        assert_eq!(args.len(), 2);
    }
}
