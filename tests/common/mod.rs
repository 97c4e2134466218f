//! Shared helpers for the integration suites.

#![allow(dead_code)]

use cinnabar::il::parse_method;
use cinnabar::vm::bridge::{ClosedBridge, SymbolTables};
use cinnabar::{PatchConfig, PatchSession, Program, Result, Value, Vm};

/// Compile a textual body with empty metadata tables.
pub fn compile(source: &str) -> Program {
    compile_with(source, SymbolTables::new())
}

/// Compile a textual body against the given tables.
pub fn compile_with(source: &str, tables: SymbolTables) -> Program {
    let body = parse_method(source, &tables).unwrap();
    let session = PatchSession::new(PatchConfig::all(), tables);
    session.compile(&body).unwrap().program
}

/// Run a compiled program on integer arguments with a closed bridge.
pub fn run_i32(program: &Program, args: &[i32]) -> Result<Value> {
    let values: Vec<Value> = args.iter().map(|&a| Value::from_i32(a)).collect();
    Vm::new().call(program, &values, &mut ClosedBridge)
}

/// Compile and run in one step, unwrapping to the integer result.
pub fn eval_i32(source: &str, args: &[i32]) -> i32 {
    run_i32(&compile(source), args).unwrap().as_i32()
}
