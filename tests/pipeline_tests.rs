//! End-to-end tests: textual bodies through the full pipeline and the VM.

mod common;

use cinnabar::error::{Error, FaultKind};
use cinnabar::il::{IlOp, MethodBody};
use cinnabar::vm::bridge::SymbolTables;
use cinnabar::{PatchConfig, PatchSession};
use common::{compile, eval_i32, run_i32};
use pretty_assertions::assert_eq;

#[test]
fn test_straightline_arithmetic() {
    // (a + b) * a - b
    let source = "\
        .method f args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        add\n\
        ldarg 0\n\
        mul\n\
        ldarg 1\n\
        sub\n\
        ret\n";
    assert_eq!(eval_i32(source, &[3, 4]), 17);
    assert_eq!(eval_i32(source, &[0, 0]), 0);
    assert_eq!(eval_i32(source, &[-2, 5]), -11);
}

#[test]
fn test_deep_expression_stack() {
    // (a + b) * (a - b), both operands live across the second subtree
    let source = "\
        .method f args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        add\n\
        ldarg 0\n\
        ldarg 1\n\
        sub\n\
        mul\n\
        ret\n";
    assert_eq!(eval_i32(source, &[5, 3]), 16);
    assert_eq!(eval_i32(source, &[7, 7]), 0);
}

#[test]
fn test_bitwise_ops() {
    let source = "\
        .method f args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        xor\n\
        ldarg 0\n\
        ldarg 1\n\
        and\n\
        or\n\
        ret\n";
    // (a ^ b) | (a & b) == a | b
    assert_eq!(eval_i32(source, &[0b1100, 0b1010]), 0b1110);
}

#[test]
fn test_shift_left() {
    let source = "\
        .method f args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        shl\n\
        ret\n";
    assert_eq!(eval_i32(source, &[3, 4]), 48);
}

#[test]
fn test_dup_squares() {
    let source = "\
        .method sq args=1 locals=0\n\
        ldarg 0\n\
        dup\n\
        mul\n\
        ret\n";
    assert_eq!(eval_i32(source, &[7]), 49);
    assert_eq!(eval_i32(source, &[-9]), 81);
}

#[test]
fn test_pop_discards() {
    let source = "\
        .method first args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        pop\n\
        ret\n";
    assert_eq!(eval_i32(source, &[5, 9]), 5);
}

#[test]
fn test_max_branch() {
    let source = "\
        .method max2 args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        bge left\n\
        ldarg 1\n\
        ret\n\
        left:\n\
        ldarg 0\n\
        ret\n";
    assert_eq!(eval_i32(source, &[3, 9]), 9);
    assert_eq!(eval_i32(source, &[9, 3]), 9);
    assert_eq!(eval_i32(source, &[4, 4]), 4);
    assert_eq!(eval_i32(source, &[-1, -5]), -1);
}

#[test]
fn test_brtrue_on_nonzero() {
    let source = "\
        .method pick args=1 locals=0\n\
        ldarg 0\n\
        brtrue yes\n\
        ldc.i4 10\n\
        ret\n\
        yes:\n\
        ldc.i4 20\n\
        ret\n";
    assert_eq!(eval_i32(source, &[0]), 10);
    assert_eq!(eval_i32(source, &[1]), 20);
    assert_eq!(eval_i32(source, &[-3]), 20);
}

#[test]
fn test_compare_pushes_flag() {
    let source = "\
        .method lt args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        clt\n\
        ret\n";
    assert_eq!(eval_i32(source, &[1, 2]), 1);
    assert_eq!(eval_i32(source, &[2, 1]), 0);
    assert_eq!(eval_i32(source, &[2, 2]), 0);
}

#[test]
fn test_gcd_loop() {
    let source = "\
        .method gcd args=2 locals=2\n\
        ldarg 0\n\
        stloc 0\n\
        ldarg 1\n\
        stloc 1\n\
        top:\n\
        ldloc 1\n\
        ldc.i4 0\n\
        beq done\n\
        ldloc 1\n\
        ldloc 0\n\
        ldloc 1\n\
        rem\n\
        stloc 1\n\
        stloc 0\n\
        br top\n\
        done:\n\
        ldloc 0\n\
        ret\n";
    assert_eq!(eval_i32(source, &[48, 18]), 6);
    assert_eq!(eval_i32(source, &[17, 5]), 1);
    assert_eq!(eval_i32(source, &[12, 0]), 12);
    assert_eq!(eval_i32(source, &[1071, 462]), 21);
}

#[test]
fn test_fib_swaps_through_loop() {
    // Iterative fibonacci; the (a, b) rotation exercises parallel-copy
    // resolution at the loop header.
    let source = "\
        .method fib args=1 locals=3\n\
        ldc.i4 0\n\
        stloc 0\n\
        ldc.i4 1\n\
        stloc 1\n\
        ldarg 0\n\
        stloc 2\n\
        top:\n\
        ldloc 2\n\
        ldc.i4 0\n\
        ble done\n\
        ldloc 1\n\
        ldloc 0\n\
        ldloc 1\n\
        add\n\
        stloc 1\n\
        stloc 0\n\
        ldloc 2\n\
        ldc.i4 1\n\
        sub\n\
        stloc 2\n\
        br top\n\
        done:\n\
        ldloc 0\n\
        ret\n";
    assert_eq!(eval_i32(source, &[0]), 0);
    assert_eq!(eval_i32(source, &[1]), 1);
    assert_eq!(eval_i32(source, &[2]), 1);
    assert_eq!(eval_i32(source, &[10]), 55);
}

#[test]
fn test_conversion_through_double() {
    let source = "\
        .method halve args=1 locals=0\n\
        ldarg 0\n\
        conv.r8\n\
        ldc.r8 0.5\n\
        mul\n\
        conv.i4\n\
        ret\n";
    assert_eq!(eval_i32(source, &[9]), 4);
    assert_eq!(eval_i32(source, &[-9]), -4);
}

#[test]
fn test_long_arithmetic() {
    let source = "\
        .method big args=0 locals=0\n\
        ldc.i8 4294967296\n\
        ldc.i8 3\n\
        mul\n\
        ret\n";
    let out = run_i32(&compile(source), &[]).unwrap();
    assert_eq!(out.as_i64(), 3i64 << 32);
}

#[test]
fn test_negative_division_truncates() {
    let div = "\
        .method f args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        div\n\
        ret\n";
    let rem = "\
        .method f args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        rem\n\
        ret\n";
    assert_eq!(eval_i32(div, &[-7, 2]), -3);
    assert_eq!(eval_i32(rem, &[-7, 2]), -1);
}

#[test]
fn test_divide_by_zero_faults() {
    let source = "\
        .method f args=2 locals=0\n\
        ldarg 0\n\
        ldarg 1\n\
        div\n\
        ret\n";
    let program = compile(source);
    assert_eq!(run_i32(&program, &[10, 5]).unwrap().as_i32(), 2);
    let err = run_i32(&program, &[1, 0]).unwrap_err();
    assert!(matches!(
        err,
        Error::Fault {
            kind: FaultKind::DivideByZero,
            ..
        }
    ));
}

#[test]
fn test_checked_add_faults_on_overflow() {
    let source = "\
        .method inc args=1 locals=0\n\
        ldarg 0\n\
        ldc.i4 1\n\
        add.ovf\n\
        ret\n";
    let program = compile(source);
    assert_eq!(run_i32(&program, &[41]).unwrap().as_i32(), 42);
    let err = run_i32(&program, &[i32::MAX]).unwrap_err();
    assert!(matches!(
        err,
        Error::Fault {
            kind: FaultKind::Overflow,
            ..
        }
    ));
}

#[test]
fn test_unchecked_add_wraps() {
    let source = "\
        .method inc args=1 locals=0\n\
        ldarg 0\n\
        ldc.i4 1\n\
        add\n\
        ret\n";
    assert_eq!(eval_i32(source, &[i32::MAX]), i32::MIN);
}

#[test]
fn test_void_method() {
    let source = "\
        .method sink args=1 locals=1 void\n\
        ldarg 0\n\
        stloc 0\n\
        ret\n";
    let program = compile(source);
    assert!(program.void);
    run_i32(&program, &[5]).unwrap();
}

#[test]
fn test_unsupported_opcode_is_fatal() {
    let mut body = MethodBody::new("bad", 0, 0);
    body.push(IlOp::Unsupported("ldelem.ref".into()));
    body.push(IlOp::Ret);
    let session = PatchSession::new(PatchConfig::all(), SymbolTables::new());
    let err = session.compile(&body).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOpcode { opcode, .. } if opcode == "ldelem.ref"));
}

#[test]
fn test_register_pressure_rejected() {
    // With copy propagation off, every stored local keeps its own slot and
    // the body overflows the register file.
    let mut body = MethodBody::new("wide", 0, 300);
    for i in 0u16..300 {
        body.push(IlOp::LdcI4(i as i32));
        body.push(IlOp::StLoc(i));
    }
    body.push(IlOp::LdLoc(0));
    body.push(IlOp::Ret);

    let mut config = PatchConfig::all();
    config.optimizer.copy_propagation = false;
    let session = PatchSession::new(config, SymbolTables::new());
    let err = session.compile(&body).unwrap_err();
    assert!(matches!(err, Error::RegisterPressure { .. }));
}
