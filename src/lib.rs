//! Cinnabar: a bytecode compiler and register VM for runtime method patching
//!
//! Cinnabar takes method bodies in a stack-based intermediate form and
//! compiles them, at run time, into compact register bytecode executed by a
//! small interpreter. The intended host is a managed application that wants
//! to replace individual method bodies without restarting: the host resolves
//! metadata into [`vm::bridge::SymbolTables`], hands bodies to a
//! [`PatchSession`], and runs the result on a [`Vm`] wired to its own
//! [`vm::bridge::NativeBridge`].
//!
//! The pipeline, in order:
//!
//! | stage | module | job |
//! |-------|--------|-----|
//! | lift | [`lift`] | block recovery, stack slots to operands |
//! | dominators | [`dom`] | dominator tree and frontiers |
//! | ssa | [`ssa`] | phi placement and renaming |
//! | optimize | [`opt`] | type inference, copy propagation, phi resolution |
//! | allocate | [`regalloc`] | live ranges onto the 256-slot register file |
//! | emit | [`emit`] | encoding and branch patching |
//!
//! ```
//! use cinnabar::{il, PatchConfig, PatchSession, Vm, Value};
//! use cinnabar::vm::bridge::{ClosedBridge, SymbolTables};
//!
//! let tables = SymbolTables::new();
//! let body = il::parse_method(
//!     ".method add2 args=2 locals=0\nldarg 0\nldarg 1\nadd\nret\n",
//!     &tables,
//! ).unwrap();
//! let session = PatchSession::new(PatchConfig::all(), tables);
//! let patch = session.compile(&body).unwrap();
//!
//! let mut vm = Vm::new();
//! let out = vm.call(
//!     &patch.program,
//!     &[Value::from_i32(2), Value::from_i32(3)],
//!     &mut ClosedBridge,
//! ).unwrap();
//! assert_eq!(out.as_i32(), 5);
//! ```

pub mod cache;
pub mod cfg;
pub mod dom;
pub mod emit;
pub mod error;
pub mod il;
pub mod ir;
pub mod lift;
pub mod opt;
pub mod patch;
pub mod regalloc;
pub mod ssa;
pub mod vm;

pub use cache::{CacheConfig, PatchCache};
pub use emit::Program;
pub use error::{Error, FaultKind, Result};
pub use opt::OptimizerConfig;
pub use patch::{CompiledPatch, PatchConfig, PatchSession};
pub use vm::{Value, Vm};

/// Crate version, also part of the patch-cache key
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
