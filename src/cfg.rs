//! Control-flow graph for one method
//!
//! Block 0 is the unique entry and is reachable from no other block. Every
//! block ends in an explicit terminator run: `Jump`, `Ret`, or a conditional
//! `Branch` followed by the `Jump` that carries its fallthrough edge (the
//! unstacker normalizes implicit fallthroughs away, so block order never
//! encodes control flow). Successor and predecessor lists are mutated only
//! during critical-edge splitting.

use crate::ir::Inst;

/// A basic block: a maximal run of source instructions between leaders
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Source instruction range `[start, end)` this block was lifted from
    pub start: usize,
    pub end: usize,
    /// Abstract instructions, ending in the terminator run
    pub instrs: Vec<Inst>,
    /// Phi instructions, present only between SSA construction and phi resolution
    pub phis: Vec<Inst>,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
    /// Operand-stack depth on entry (drives the stack-slot phi exception)
    pub live_in_stack: usize,
}

impl BasicBlock {
    /// Index of the first terminator instruction (phi-resolution moves are
    /// inserted immediately before it)
    pub fn terminator_start(&self) -> usize {
        let mut idx = self.instrs.len();
        while idx > 0 && self.instrs[idx - 1].is_terminator() {
            idx -= 1;
        }
        idx
    }
}

/// The control-flow graph: owns all basic blocks of one method
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    /// Number of method arguments (register slots 0..arg_count at the end)
    pub arg_count: u16,
    /// Number of method locals
    pub local_count: u16,
}

impl Cfg {
    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append a block, returning its index
    pub fn add_block(&mut self, block: BasicBlock) -> usize {
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Add a `from -> to` edge to both adjacency lists
    pub fn add_edge(&mut self, from: usize, to: usize) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    /// Replace the `from -> old` edge with `from -> new`, repointing the
    /// terminator and both adjacency lists (critical-edge splitting)
    pub fn repoint_edge(&mut self, from: usize, old: usize, new: usize) {
        if let Some(slot) = self.blocks[from].succs.iter_mut().find(|s| **s == old) {
            *slot = new;
        }
        if let Some(pos) = self.blocks[old].preds.iter().position(|p| *p == from) {
            self.blocks[old].preds.remove(pos);
        }
        self.blocks[new].preds.push(from);
        let term_start = self.blocks[from].terminator_start();
        for inst in &mut self.blocks[from].instrs[term_start..] {
            inst.retarget(old, new);
        }
    }

    /// Total abstract instruction count (phis excluded)
    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Render the graph for debugging
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, block) in self.blocks.iter().enumerate() {
            let _ = writeln!(
                out,
                "b{}: il [{}, {}) preds {:?} succs {:?} stack-in {}",
                i, block.start, block.end, block.preds, block.succs, block.live_in_stack
            );
            for phi in &block.phis {
                let _ = writeln!(out, "    {}", phi);
            }
            for inst in &block.instrs {
                let _ = writeln!(out, "    {}", inst);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Cond, ConstValue, Inst, Operand};

    #[test]
    fn test_terminator_start() {
        let block = BasicBlock {
            instrs: vec![
                Inst::Move {
                    dst: Operand::stack(0),
                    src: Operand::arg(0),
                },
                Inst::Branch {
                    cond: Cond::Eq,
                    lhs: Operand::stack(0),
                    rhs: Operand::konst(ConstValue::I32(0)),
                    target: 2,
                },
                Inst::Jump { target: 1 },
            ],
            ..Default::default()
        };
        assert_eq!(block.terminator_start(), 1);
    }

    #[test]
    fn test_repoint_edge() {
        let mut cfg = Cfg::default();
        for _ in 0..3 {
            cfg.add_block(BasicBlock::default());
        }
        cfg.blocks[0].instrs.push(Inst::Jump { target: 1 });
        cfg.add_edge(0, 1);
        cfg.repoint_edge(0, 1, 2);
        assert_eq!(cfg.blocks[0].succs, vec![2]);
        assert!(cfg.blocks[1].preds.is_empty());
        assert_eq!(cfg.blocks[2].preds, vec![0]);
        assert_eq!(cfg.blocks[0].instrs[0], Inst::Jump { target: 2 });
    }
}
