//! SSA-level optimization passes
//!
//! The pipeline between SSA construction and register allocation. Type
//! inference always runs (opcode selection needs operand kinds); copy
//! propagation is configurable; phi resolution always runs last because it
//! takes the graph out of SSA form.

mod copyprop;
mod phi_out;
mod typeinfer;

pub use phi_out::TmpAlloc;

use crate::cfg::Cfg;
use crate::error::Result;
use crate::ir::Inst;
use crate::vm::bridge::SymbolTables;
use tracing::debug;

/// Configuration for the optimization pipeline
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Forward copies through their uses and drop dead moves
    pub copy_propagation: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            copy_propagation: true,
        }
    }
}

/// Runs the SSA pass pipeline over one method
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Optimizer { config }
    }

    /// Run all passes; afterwards the graph is out of SSA form and free of
    /// phis and nops.
    pub fn run(&self, cfg: &mut Cfg, tables: &SymbolTables, tmps: &mut TmpAlloc) -> Result<()> {
        typeinfer::infer(cfg, tables)?;
        if self.config.copy_propagation {
            let killed = copyprop::run(cfg);
            debug!(killed, "copy propagation");
        }
        phi_out::resolve(cfg, tmps)?;
        for block in &mut cfg.blocks {
            block.instrs.retain(|inst| *inst != Inst::Nop);
        }
        Ok(())
    }
}
