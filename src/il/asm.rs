//! Textual form of the source instruction stream
//!
//! A line-oriented assembler used by the CLI and the test suites. This is a
//! debugging surface, not the host container format: metadata references are
//! resolved by name against already-built symbol tables.
//!
//! ```text
//! .method gcd args=2 locals=0
//! loop:
//!     ldarg 1
//!     ldc.i4 0
//!     beq done
//!     ...
//!     br loop
//! done:
//!     ldarg 0
//!     ret
//! ```

use super::{BodyFlags, IlOp, MethodBody};
use crate::error::{Error, Result};
use crate::vm::bridge::SymbolTables;
use rustc_hash::FxHashMap;

/// Parse a single method from its textual form.
///
/// `tables` resolves `call`/`newobj`/field mnemonics; a name with no table
/// entry is an unresolved-symbol error, exactly as it would be at patch-build
/// time.
pub fn parse_method(source: &str, tables: &SymbolTables) -> Result<MethodBody> {
    let mut body: Option<MethodBody> = None;
    let mut labels: FxHashMap<String, usize> = FxHashMap::default();
    // (instruction index, label name, source line) patched after the scan
    let mut fixups: Vec<(usize, String, usize)> = Vec::new();

    for (line_no, raw) in source.lines().enumerate() {
        let line_no = line_no + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix(".method") {
            if body.is_some() {
                return Err(Error::asm_error("multiple .method directives", line_no));
            }
            body = Some(parse_directive(rest, line_no)?);
            continue;
        }

        let body = body
            .as_mut()
            .ok_or_else(|| Error::asm_error("instruction before .method directive", line_no))?;

        if let Some(label) = line.strip_suffix(':') {
            let label = label.trim();
            if labels
                .insert(label.to_string(), body.instructions.len())
                .is_some()
            {
                return Err(Error::asm_error(
                    format!("duplicate label '{}'", label),
                    line_no,
                ));
            }
            continue;
        }

        let (mnemonic, operand) = split_once_ws(line);
        let index = body.instructions.len();
        let op = parse_op(mnemonic, operand, tables, index, line_no, &mut fixups)?;
        body.push(op);
    }

    let mut body = body.ok_or_else(|| Error::asm_error("missing .method directive", 1))?;

    for (index, label, line_no) in fixups {
        let target = *labels
            .get(&label)
            .ok_or_else(|| Error::asm_error(format!("undefined label '{}'", label), line_no))?;
        retarget(&mut body, index, target);
    }

    Ok(body)
}

/// Parse `.method NAME args=N locals=N [instance] [void]`
fn parse_directive(rest: &str, line_no: usize) -> Result<MethodBody> {
    let mut name = None;
    let mut arg_count = 0u16;
    let mut local_count = 0u16;
    let mut flags = BodyFlags::empty();

    for token in rest.split_whitespace() {
        if let Some(value) = token.strip_prefix("args=") {
            arg_count = value
                .parse()
                .map_err(|_| Error::asm_error(format!("bad args count '{}'", value), line_no))?;
        } else if let Some(value) = token.strip_prefix("locals=") {
            local_count = value
                .parse()
                .map_err(|_| Error::asm_error(format!("bad locals count '{}'", value), line_no))?;
        } else if token == "instance" {
            flags |= BodyFlags::INSTANCE;
        } else if token == "void" {
            flags |= BodyFlags::VOID;
        } else if name.is_none() {
            name = Some(token.to_string());
        } else {
            return Err(Error::asm_error(
                format!("unexpected token '{}'", token),
                line_no,
            ));
        }
    }

    let name = name.ok_or_else(|| Error::asm_error("missing method name", line_no))?;
    let mut body = MethodBody::new(name, arg_count, local_count);
    body.flags = flags;
    Ok(body)
}

fn parse_op(
    mnemonic: &str,
    operand: Option<&str>,
    tables: &SymbolTables,
    index: usize,
    line_no: usize,
    fixups: &mut Vec<(usize, String, usize)>,
) -> Result<IlOp> {
    let mut label_target = |fixups: &mut Vec<(usize, String, usize)>| -> Result<usize> {
        let label = operand
            .ok_or_else(|| Error::asm_error(format!("'{}' needs a label", mnemonic), line_no))?;
        fixups.push((index, label.to_string(), line_no));
        // Placeholder until label fixup
        Ok(usize::MAX)
    };

    let op = match mnemonic {
        "ldarg" => IlOp::LdArg(parse_num(mnemonic, operand, line_no)?),
        "ldloc" => IlOp::LdLoc(parse_num(mnemonic, operand, line_no)?),
        "stloc" => IlOp::StLoc(parse_num(mnemonic, operand, line_no)?),
        "ldc.i4" => IlOp::LdcI4(parse_num(mnemonic, operand, line_no)?),
        "ldc.i8" => IlOp::LdcI8(parse_num(mnemonic, operand, line_no)?),
        "ldc.r4" => IlOp::LdcR4(parse_num(mnemonic, operand, line_no)?),
        "ldc.r8" => IlOp::LdcR8(parse_num(mnemonic, operand, line_no)?),
        "ldnull" => IlOp::LdNull,
        "dup" => IlOp::Dup,
        "pop" => IlOp::Pop,
        "add" => IlOp::Add,
        "sub" => IlOp::Sub,
        "mul" => IlOp::Mul,
        "div" => IlOp::Div,
        "rem" => IlOp::Rem,
        "neg" => IlOp::Neg,
        "add.ovf" => IlOp::AddOvf,
        "sub.ovf" => IlOp::SubOvf,
        "mul.ovf" => IlOp::MulOvf,
        "and" => IlOp::And,
        "or" => IlOp::Or,
        "xor" => IlOp::Xor,
        "shl" => IlOp::Shl,
        "shr" => IlOp::Shr,
        "not" => IlOp::Not,
        "ceq" => IlOp::Ceq,
        "cgt" => IlOp::Cgt,
        "clt" => IlOp::Clt,
        "conv.i4" => IlOp::ConvI4,
        "conv.i8" => IlOp::ConvI8,
        "conv.r4" => IlOp::ConvR4,
        "conv.r8" => IlOp::ConvR8,
        "br" => IlOp::Br(label_target(fixups)?),
        "brtrue" => IlOp::BrTrue(label_target(fixups)?),
        "brfalse" => IlOp::BrFalse(label_target(fixups)?),
        "beq" => IlOp::Beq(label_target(fixups)?),
        "bne" => IlOp::Bne(label_target(fixups)?),
        "blt" => IlOp::Blt(label_target(fixups)?),
        "ble" => IlOp::Ble(label_target(fixups)?),
        "bgt" => IlOp::Bgt(label_target(fixups)?),
        "bge" => IlOp::Bge(label_target(fixups)?),
        "ret" => IlOp::Ret,
        "call" => IlOp::Call(tables.method_index(symbol(mnemonic, operand, line_no)?)?),
        "newobj" => IlOp::NewObj(tables.method_index(symbol(mnemonic, operand, line_no)?)?),
        "ldfld" => IlOp::LdFld(tables.field_index(symbol(mnemonic, operand, line_no)?)?),
        "stfld" => IlOp::StFld(tables.field_index(symbol(mnemonic, operand, line_no)?)?),
        "ldsfld" => IlOp::LdsFld(tables.field_index(symbol(mnemonic, operand, line_no)?)?),
        "stsfld" => IlOp::StsFld(tables.field_index(symbol(mnemonic, operand, line_no)?)?),
        other => return Err(Error::unsupported_opcode(other, index)),
    };
    Ok(op)
}

fn parse_num<T: std::str::FromStr>(
    mnemonic: &str,
    operand: Option<&str>,
    line_no: usize,
) -> Result<T> {
    let text = operand
        .ok_or_else(|| Error::asm_error(format!("'{}' needs an operand", mnemonic), line_no))?;
    text.parse().map_err(|_| {
        Error::asm_error(
            format!("bad operand '{}' for '{}'", text, mnemonic),
            line_no,
        )
    })
}

fn symbol<'a>(mnemonic: &str, operand: Option<&'a str>, line_no: usize) -> Result<&'a str> {
    operand.ok_or_else(|| Error::asm_error(format!("'{}' needs a symbol name", mnemonic), line_no))
}

fn strip_comment(line: &str) -> &str {
    let end = line
        .find("//")
        .or_else(|| line.find(';'))
        .unwrap_or(line.len());
    &line[..end]
}

fn split_once_ws(line: &str) -> (&str, Option<&str>) {
    match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, Some(rest.trim())),
        None => (line, None),
    }
}

fn retarget(body: &mut MethodBody, index: usize, target: usize) {
    let op = &mut body.instructions[index].op;
    match op {
        IlOp::Br(t)
        | IlOp::BrTrue(t)
        | IlOp::BrFalse(t)
        | IlOp::Beq(t)
        | IlOp::Bne(t)
        | IlOp::Blt(t)
        | IlOp::Ble(t)
        | IlOp::Bgt(t)
        | IlOp::Bge(t) => *t = target,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bridge::{MethodHandle, ParamKind};

    #[test]
    fn test_parse_straightline() {
        let body = parse_method(
            ".method add2 args=2 locals=0\nldarg 0\nldarg 1\nadd\nret\n",
            &SymbolTables::new(),
        )
        .unwrap();
        assert_eq!(body.name, "add2");
        assert_eq!(body.arg_count, 2);
        assert_eq!(body.instructions.len(), 4);
        assert_eq!(body.instructions[2].op, IlOp::Add);
    }

    #[test]
    fn test_parse_labels_and_comments() {
        let body = parse_method(
            "// countdown\n\
             .method count args=1 locals=1\n\
             top:\n\
             ldarg 0\n\
             ldc.i4 0 ; compare against zero\n\
             ble done\n\
             ldarg 0\n\
             ldc.i4 1\n\
             sub\n\
             stloc 0\n\
             br top\n\
             done:\n\
             ldarg 0\n\
             ret\n",
            &SymbolTables::new(),
        )
        .unwrap();
        assert_eq!(body.instructions[2].op, IlOp::Ble(8));
        assert_eq!(body.instructions[7].op, IlOp::Br(0));
    }

    #[test]
    fn test_unknown_mnemonic_is_fatal() {
        let err = parse_method(
            ".method bad args=0 locals=0\nldelem 0\nret\n",
            &SymbolTables::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOpcode { .. }));
    }

    #[test]
    fn test_unresolved_call() {
        let err = parse_method(
            ".method bad args=0 locals=0\ncall Missing::Method\nret\n",
            &SymbolTables::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnresolvedSymbol { .. }));
    }

    #[test]
    fn test_resolved_call() {
        let mut tables = SymbolTables::new();
        tables.add_method(MethodHandle::new("Math::Abs", vec![ParamKind::Int], ParamKind::Int));
        let body = parse_method(
            ".method wrap args=1 locals=0\nldarg 0\ncall Math::Abs\nret\n",
            &tables,
        )
        .unwrap();
        assert_eq!(body.instructions[1].op, IlOp::Call(0));
    }

    #[test]
    fn test_undefined_label() {
        let err = parse_method(
            ".method bad args=0 locals=0\nbr nowhere\nret\n",
            &SymbolTables::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::AsmError { .. }));
    }
}
