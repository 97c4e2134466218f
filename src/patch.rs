//! Patch sessions
//!
//! A session holds the resolved metadata tables and the set of method names
//! selected for replacement, and drives one body at a time through the full
//! pipeline: lift, dominators, SSA, optimization, register allocation,
//! emission. Methods outside the target set are skipped so the host can feed
//! every body it loads without filtering first.

use crate::dom::DomTree;
use crate::emit::{emit, Program};
use crate::error::Result;
use crate::il::MethodBody;
use crate::lift::lift;
use crate::opt::{Optimizer, OptimizerConfig, TmpAlloc};
use crate::regalloc::allocate;
use crate::ssa::construct_ssa;
use crate::vm::bridge::SymbolTables;
use tracing::{debug, info, trace};

/// Session-wide settings
#[derive(Debug, Clone, Default)]
pub struct PatchConfig {
    /// Method names selected for patching; empty selects every method
    pub targets: Vec<String>,
    pub optimizer: OptimizerConfig,
}

impl PatchConfig {
    /// Target every method the session sees
    pub fn all() -> Self {
        Self::default()
    }

    /// Target only the named methods
    pub fn targeting<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PatchConfig {
            targets: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// One compiled replacement body
#[derive(Debug, Clone)]
pub struct CompiledPatch {
    pub program: Program,
}

impl CompiledPatch {
    /// Registers the body addresses at run time
    pub fn register_count(&self) -> u16 {
        self.program.register_count
    }

    /// Code offsets of the body's basic blocks
    pub fn block_starts(&self) -> &[u32] {
        &self.program.block_starts
    }
}

/// A compilation session over one set of metadata tables
pub struct PatchSession {
    config: PatchConfig,
    tables: SymbolTables,
}

impl PatchSession {
    pub fn new(config: PatchConfig, tables: SymbolTables) -> Self {
        PatchSession { config, tables }
    }

    pub fn tables(&self) -> &SymbolTables {
        &self.tables
    }

    /// True if the session's target set selects `name`
    pub fn is_targeted(&self, name: &str) -> bool {
        self.config.targets.is_empty() || self.config.targets.iter().any(|t| t == name)
    }

    /// Compile one method body through the whole pipeline.
    pub fn compile(&self, body: &MethodBody) -> Result<CompiledPatch> {
        debug!(method = %body.name, insts = body.instructions.len(), "compiling");

        let mut cfg = lift(body, &self.tables)?;
        trace!(method = %body.name, blocks = cfg.len(), "lifted");

        let dom = DomTree::build(&cfg);
        construct_ssa(&mut cfg, &dom)?;

        let mut tmps = TmpAlloc::new();
        Optimizer::new(self.config.optimizer.clone()).run(&mut cfg, &self.tables, &mut tmps)?;

        let alloc = allocate(&mut cfg)?;
        let program = emit(&cfg, &alloc, &self.tables, body)?;

        info!(
            method = %body.name,
            bytes = program.code.len(),
            registers = program.register_count,
            "patch compiled"
        );
        Ok(CompiledPatch { program })
    }

    /// Compile `body` if its name is targeted; `Ok(None)` otherwise.
    pub fn compile_if_targeted(&self, body: &MethodBody) -> Result<Option<CompiledPatch>> {
        if !self.is_targeted(&body.name) {
            trace!(method = %body.name, "not targeted, skipped");
            return Ok(None);
        }
        self.compile(body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::parse_method;

    #[test]
    fn test_untargeted_method_skipped() {
        let tables = SymbolTables::new();
        let body = parse_method(
            ".method helper args=0 locals=0\nldc.i4 1\nret\n",
            &tables,
        )
        .unwrap();
        let session = PatchSession::new(PatchConfig::targeting(["Other::Method"]), tables);
        assert!(session.compile_if_targeted(&body).unwrap().is_none());
    }

    #[test]
    fn test_targeted_method_compiles() {
        let tables = SymbolTables::new();
        let body = parse_method(
            ".method hot args=2 locals=0\nldarg 0\nldarg 1\nadd\nret\n",
            &tables,
        )
        .unwrap();
        let session = PatchSession::new(PatchConfig::targeting(["hot"]), tables);
        let patch = session.compile_if_targeted(&body).unwrap().unwrap();
        assert!(!patch.program.code.is_empty());
        assert!(patch.register_count() >= 2);
        assert_eq!(patch.block_starts(), &[0]);
    }

    #[test]
    fn test_empty_target_set_selects_all() {
        let session = PatchSession::new(PatchConfig::all(), SymbolTables::new());
        assert!(session.is_targeted("anything"));
    }
}
