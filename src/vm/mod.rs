//! The register virtual machine
//!
//! A flat file of 256 [`Value`] cells and a dispatch loop over the encoded
//! program. Calls, allocations and field access leave the VM through a
//! [`NativeBridge`]; everything else executes in place.
//!
//! Object handles in registers are the object-table index plus one, so a
//! zero register is the null reference. Faults (overflow, division by zero,
//! bad handles) surface as errors carrying the code offset of the faulting
//! instruction; the register file is left as it was when the fault hit.

pub mod bridge;
pub mod opcode;
pub mod value;

pub use value::Value;

use crate::emit::Program;
use crate::error::{Error, FaultKind, Result};
use crate::vm::bridge::{
    FieldHandle, MethodHandle, NativeBridge, NativeValue, ObjectTable, ParamKind,
};
use crate::vm::opcode::{read_i32, read_u16, read_u32, read_u64, VmOp};
use tracing::trace;

const REGISTER_FILE: usize = 256;

/// The interpreter state: register file and object table
pub struct Vm {
    regs: Vec<Value>,
    pub objects: ObjectTable,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            regs: vec![Value::ZERO; REGISTER_FILE],
            objects: ObjectTable::new(),
        }
    }

    pub fn reg(&self, index: u8) -> Value {
        self.regs[index as usize]
    }

    pub fn set_reg(&mut self, index: u8, value: Value) {
        self.regs[index as usize] = value;
    }

    /// Zero the file, marshal `args` into registers `0..args.len()`, and run.
    pub fn call(
        &mut self,
        program: &Program,
        args: &[Value],
        bridge: &mut dyn NativeBridge,
    ) -> Result<Value> {
        if args.len() != program.arg_count as usize {
            return Err(Error::InternalError(format!(
                "{} takes {} arguments, got {}",
                program.name,
                program.arg_count,
                args.len()
            )));
        }
        for reg in &mut self.regs {
            *reg = Value::ZERO;
        }
        for (i, &arg) in args.iter().enumerate() {
            self.regs[i] = arg;
        }
        self.run(program, bridge)
    }

    /// Execute from offset 0 until `Ret`; register 0 holds the result.
    pub fn run(&mut self, program: &Program, bridge: &mut dyn NativeBridge) -> Result<Value> {
        let code = &program.code;
        let mut ip = 0usize;
        trace!(method = %program.name, bytes = code.len(), "entering");

        loop {
            if ip + 2 > code.len() {
                return Err(Error::invalid_opcode(ip));
            }
            let op = VmOp::from_u16(read_u16(code, ip)).ok_or_else(|| Error::invalid_opcode(ip))?;
            let f = ip + 2;
            let next = ip + op.form().width();

            macro_rules! r {
                ($at:expr) => {
                    self.regs[code[$at] as usize]
                };
            }
            macro_rules! set {
                ($at:expr, $v:expr) => {
                    self.regs[code[$at] as usize] = $v
                };
            }
            // dst, lhs, rhs arithmetic over a register view
            macro_rules! arith {
                ($get:ident, $put:ident, $op:tt) => {{
                    let v = r!(f + 1).$get() $op r!(f + 2).$get();
                    set!(f, Value::$put(v));
                }};
            }
            macro_rules! cmp {
                ($get:ident, $op:tt) => {{
                    let v = r!(f + 1).$get() $op r!(f + 2).$get();
                    set!(f, Value::from_i32(v as i32));
                }};
            }
            macro_rules! branch {
                ($get:ident, $op:tt) => {{
                    if r!(f).$get() $op r!(f + 1).$get() {
                        ip = offset(ip, read_i32(code, f + 2));
                        continue;
                    }
                }};
            }
            macro_rules! branch_imm {
                ($op:tt) => {{
                    if r!(f).as_i32() $op read_i32(code, f + 1) {
                        ip = offset(ip, read_i32(code, f + 5));
                        continue;
                    }
                }};
            }

            match op {
                VmOp::Nop => {}
                VmOp::Ret => return Ok(self.regs[0]),
                VmOp::Jmp => {
                    ip = offset(ip, read_i32(code, f));
                    continue;
                }
                VmOp::Mov => set!(f, r!(f + 1)),

                VmOp::LdcI32 => set!(f, Value::from_i32(read_i32(code, f + 1))),
                VmOp::LdcI64 => set!(f, Value::from_i64(read_u64(code, f + 1) as i64)),
                VmOp::LdcF32 => set!(f, Value::from_f32(f32::from_bits(read_u32(code, f + 1)))),
                VmOp::LdcF64 => set!(f, Value::from_f64(f64::from_bits(read_u64(code, f + 1)))),
                VmOp::LdNull => set!(f, Value::ZERO),

                VmOp::AddI32 => {
                    set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_add(r!(f + 2).as_i32())))
                }
                VmOp::SubI32 => {
                    set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_sub(r!(f + 2).as_i32())))
                }
                VmOp::MulI32 => {
                    set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_mul(r!(f + 2).as_i32())))
                }
                VmOp::DivI32 => {
                    let v = div_i32(r!(f + 1).as_i32(), r!(f + 2).as_i32(), ip)?;
                    set!(f, Value::from_i32(v));
                }
                VmOp::RemI32 => {
                    let v = rem_i32(r!(f + 1).as_i32(), r!(f + 2).as_i32(), ip)?;
                    set!(f, Value::from_i32(v));
                }
                VmOp::AndI32 => arith!(as_i32, from_i32, &),
                VmOp::OrI32 => arith!(as_i32, from_i32, |),
                VmOp::XorI32 => arith!(as_i32, from_i32, ^),
                VmOp::ShlI32 => {
                    set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_shl(r!(f + 2).as_i32() as u32)))
                }
                VmOp::ShrI32 => {
                    set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_shr(r!(f + 2).as_i32() as u32)))
                }

                VmOp::AddI64 => {
                    set!(f, Value::from_i64(r!(f + 1).as_i64().wrapping_add(r!(f + 2).as_i64())))
                }
                VmOp::SubI64 => {
                    set!(f, Value::from_i64(r!(f + 1).as_i64().wrapping_sub(r!(f + 2).as_i64())))
                }
                VmOp::MulI64 => {
                    set!(f, Value::from_i64(r!(f + 1).as_i64().wrapping_mul(r!(f + 2).as_i64())))
                }
                VmOp::DivI64 => {
                    let (a, b) = (r!(f + 1).as_i64(), r!(f + 2).as_i64());
                    if b == 0 {
                        return Err(Error::divide_by_zero(ip));
                    }
                    let v = a.checked_div(b).ok_or_else(|| Error::overflow(ip))?;
                    set!(f, Value::from_i64(v));
                }
                VmOp::RemI64 => {
                    let (a, b) = (r!(f + 1).as_i64(), r!(f + 2).as_i64());
                    if b == 0 {
                        return Err(Error::divide_by_zero(ip));
                    }
                    let v = a.checked_rem(b).ok_or_else(|| Error::overflow(ip))?;
                    set!(f, Value::from_i64(v));
                }
                VmOp::AndI64 => arith!(as_i64, from_i64, &),
                VmOp::OrI64 => arith!(as_i64, from_i64, |),
                VmOp::XorI64 => arith!(as_i64, from_i64, ^),
                VmOp::ShlI64 => {
                    set!(f, Value::from_i64(r!(f + 1).as_i64().wrapping_shl(r!(f + 2).as_i64() as u32)))
                }
                VmOp::ShrI64 => {
                    set!(f, Value::from_i64(r!(f + 1).as_i64().wrapping_shr(r!(f + 2).as_i64() as u32)))
                }

                VmOp::AddF32 => arith!(as_f32, from_f32, +),
                VmOp::SubF32 => arith!(as_f32, from_f32, -),
                VmOp::MulF32 => arith!(as_f32, from_f32, *),
                VmOp::DivF32 => arith!(as_f32, from_f32, /),
                VmOp::RemF32 => arith!(as_f32, from_f32, %),
                VmOp::AddF64 => arith!(as_f64, from_f64, +),
                VmOp::SubF64 => arith!(as_f64, from_f64, -),
                VmOp::MulF64 => arith!(as_f64, from_f64, *),
                VmOp::DivF64 => arith!(as_f64, from_f64, /),
                VmOp::RemF64 => arith!(as_f64, from_f64, %),

                VmOp::AddI32Chk => {
                    let v = r!(f + 1)
                        .as_i32()
                        .checked_add(r!(f + 2).as_i32())
                        .ok_or_else(|| Error::overflow(ip))?;
                    set!(f, Value::from_i32(v));
                }
                VmOp::SubI32Chk => {
                    let v = r!(f + 1)
                        .as_i32()
                        .checked_sub(r!(f + 2).as_i32())
                        .ok_or_else(|| Error::overflow(ip))?;
                    set!(f, Value::from_i32(v));
                }
                VmOp::MulI32Chk => {
                    let v = r!(f + 1)
                        .as_i32()
                        .checked_mul(r!(f + 2).as_i32())
                        .ok_or_else(|| Error::overflow(ip))?;
                    set!(f, Value::from_i32(v));
                }
                VmOp::AddI64Chk => {
                    let v = r!(f + 1)
                        .as_i64()
                        .checked_add(r!(f + 2).as_i64())
                        .ok_or_else(|| Error::overflow(ip))?;
                    set!(f, Value::from_i64(v));
                }
                VmOp::SubI64Chk => {
                    let v = r!(f + 1)
                        .as_i64()
                        .checked_sub(r!(f + 2).as_i64())
                        .ok_or_else(|| Error::overflow(ip))?;
                    set!(f, Value::from_i64(v));
                }
                VmOp::MulI64Chk => {
                    let v = r!(f + 1)
                        .as_i64()
                        .checked_mul(r!(f + 2).as_i64())
                        .ok_or_else(|| Error::overflow(ip))?;
                    set!(f, Value::from_i64(v));
                }

                VmOp::AddI32Imm => {
                    set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_add(read_i32(code, f + 2))))
                }
                VmOp::SubI32Imm => {
                    set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_sub(read_i32(code, f + 2))))
                }
                VmOp::MulI32Imm => {
                    set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_mul(read_i32(code, f + 2))))
                }

                VmOp::NegI32 => set!(f, Value::from_i32(r!(f + 1).as_i32().wrapping_neg())),
                VmOp::NegI64 => set!(f, Value::from_i64(r!(f + 1).as_i64().wrapping_neg())),
                VmOp::NegF32 => set!(f, Value::from_f32(-r!(f + 1).as_f32())),
                VmOp::NegF64 => set!(f, Value::from_f64(-r!(f + 1).as_f64())),
                VmOp::NotI32 => set!(f, Value::from_i32(!r!(f + 1).as_i32())),
                VmOp::NotI64 => set!(f, Value::from_i64(!r!(f + 1).as_i64())),

                VmOp::I32ToI64 => set!(f, Value::from_i64(r!(f + 1).as_i32() as i64)),
                VmOp::I32ToF32 => set!(f, Value::from_f32(r!(f + 1).as_i32() as f32)),
                VmOp::I32ToF64 => set!(f, Value::from_f64(r!(f + 1).as_i32() as f64)),
                VmOp::I64ToI32 => set!(f, Value::from_i32(r!(f + 1).as_i64() as i32)),
                VmOp::I64ToF32 => set!(f, Value::from_f32(r!(f + 1).as_i64() as f32)),
                VmOp::I64ToF64 => set!(f, Value::from_f64(r!(f + 1).as_i64() as f64)),
                VmOp::F32ToI32 => set!(f, Value::from_i32(r!(f + 1).as_f32() as i32)),
                VmOp::F32ToI64 => set!(f, Value::from_i64(r!(f + 1).as_f32() as i64)),
                VmOp::F32ToF64 => set!(f, Value::from_f64(r!(f + 1).as_f32() as f64)),
                VmOp::F64ToI32 => set!(f, Value::from_i32(r!(f + 1).as_f64() as i32)),
                VmOp::F64ToI64 => set!(f, Value::from_i64(r!(f + 1).as_f64() as i64)),
                VmOp::F64ToF32 => set!(f, Value::from_f32(r!(f + 1).as_f64() as f32)),

                VmOp::CmpEqI32 => cmp!(as_i32, ==),
                VmOp::CmpNeI32 => cmp!(as_i32, !=),
                VmOp::CmpLtI32 => cmp!(as_i32, <),
                VmOp::CmpLeI32 => cmp!(as_i32, <=),
                VmOp::CmpGtI32 => cmp!(as_i32, >),
                VmOp::CmpGeI32 => cmp!(as_i32, >=),
                VmOp::CmpEqI64 => cmp!(as_i64, ==),
                VmOp::CmpNeI64 => cmp!(as_i64, !=),
                VmOp::CmpLtI64 => cmp!(as_i64, <),
                VmOp::CmpLeI64 => cmp!(as_i64, <=),
                VmOp::CmpGtI64 => cmp!(as_i64, >),
                VmOp::CmpGeI64 => cmp!(as_i64, >=),
                VmOp::CmpEqF32 => cmp!(as_f32, ==),
                VmOp::CmpNeF32 => cmp!(as_f32, !=),
                VmOp::CmpLtF32 => cmp!(as_f32, <),
                VmOp::CmpLeF32 => cmp!(as_f32, <=),
                VmOp::CmpGtF32 => cmp!(as_f32, >),
                VmOp::CmpGeF32 => cmp!(as_f32, >=),
                VmOp::CmpEqF64 => cmp!(as_f64, ==),
                VmOp::CmpNeF64 => cmp!(as_f64, !=),
                VmOp::CmpLtF64 => cmp!(as_f64, <),
                VmOp::CmpLeF64 => cmp!(as_f64, <=),
                VmOp::CmpGtF64 => cmp!(as_f64, >),
                VmOp::CmpGeF64 => cmp!(as_f64, >=),
                VmOp::CmpEqI32Imm => {
                    set!(f, Value::from_i32((r!(f + 1).as_i32() == read_i32(code, f + 2)) as i32))
                }
                VmOp::CmpNeI32Imm => {
                    set!(f, Value::from_i32((r!(f + 1).as_i32() != read_i32(code, f + 2)) as i32))
                }
                VmOp::CmpLtI32Imm => {
                    set!(f, Value::from_i32((r!(f + 1).as_i32() < read_i32(code, f + 2)) as i32))
                }
                VmOp::CmpLeI32Imm => {
                    set!(f, Value::from_i32((r!(f + 1).as_i32() <= read_i32(code, f + 2)) as i32))
                }
                VmOp::CmpGtI32Imm => {
                    set!(f, Value::from_i32((r!(f + 1).as_i32() > read_i32(code, f + 2)) as i32))
                }
                VmOp::CmpGeI32Imm => {
                    set!(f, Value::from_i32((r!(f + 1).as_i32() >= read_i32(code, f + 2)) as i32))
                }

                VmOp::BrEqI32 => branch!(as_i32, ==),
                VmOp::BrNeI32 => branch!(as_i32, !=),
                VmOp::BrLtI32 => branch!(as_i32, <),
                VmOp::BrLeI32 => branch!(as_i32, <=),
                VmOp::BrGtI32 => branch!(as_i32, >),
                VmOp::BrGeI32 => branch!(as_i32, >=),
                VmOp::BrEqI64 => branch!(as_i64, ==),
                VmOp::BrNeI64 => branch!(as_i64, !=),
                VmOp::BrLtI64 => branch!(as_i64, <),
                VmOp::BrLeI64 => branch!(as_i64, <=),
                VmOp::BrGtI64 => branch!(as_i64, >),
                VmOp::BrGeI64 => branch!(as_i64, >=),
                VmOp::BrEqF32 => branch!(as_f32, ==),
                VmOp::BrNeF32 => branch!(as_f32, !=),
                VmOp::BrLtF32 => branch!(as_f32, <),
                VmOp::BrLeF32 => branch!(as_f32, <=),
                VmOp::BrGtF32 => branch!(as_f32, >),
                VmOp::BrGeF32 => branch!(as_f32, >=),
                VmOp::BrEqF64 => branch!(as_f64, ==),
                VmOp::BrNeF64 => branch!(as_f64, !=),
                VmOp::BrLtF64 => branch!(as_f64, <),
                VmOp::BrLeF64 => branch!(as_f64, <=),
                VmOp::BrGtF64 => branch!(as_f64, >),
                VmOp::BrGeF64 => branch!(as_f64, >=),
                VmOp::BrEqI32Imm => branch_imm!(==),
                VmOp::BrNeI32Imm => branch_imm!(!=),
                VmOp::BrLtI32Imm => branch_imm!(<),
                VmOp::BrLeI32Imm => branch_imm!(<=),
                VmOp::BrGtI32Imm => branch_imm!(>),
                VmOp::BrGeI32Imm => branch_imm!(>=),

                VmOp::CallNative => {
                    let index = read_u32(code, f + 2);
                    let method = method_at(program, index, ip)?;
                    let base = code[f + 1] as usize;
                    let args = self.marshal_out(method, base)?;
                    let ret = bridge.invoke(method, &args, &mut self.objects)?;
                    for (pos, value) in &ret.writebacks {
                        self.regs[base + pos] = from_native(*value);
                    }
                    if method.returns_value() {
                        let value = ret.value.ok_or_else(|| {
                            Error::InternalError(format!(
                                "bridge returned nothing for {}",
                                method.name
                            ))
                        })?;
                        set!(f, from_native(value));
                    }
                }
                VmOp::NewObj => {
                    let index = read_u32(code, f + 2);
                    let ctor = method_at(program, index, ip)?;
                    let base = code[f + 1] as usize;
                    let args = self.marshal_out(ctor, base)?;
                    let handle = bridge.construct(ctor, &args, &mut self.objects)?;
                    set!(f, Value::from_handle(handle + 1));
                }
                VmOp::LdFld => {
                    let field = field_at(program, read_u32(code, f + 2), ip)?;
                    let obj = handle_of(r!(f + 1), ip)?;
                    let value = bridge.load_field(field, obj, &mut self.objects)?;
                    set!(f, from_native(value));
                }
                VmOp::StFld => {
                    let field = field_at(program, read_u32(code, f + 2), ip)?;
                    let obj = handle_of(r!(f), ip)?;
                    let value = to_native(field.kind, r!(f + 1));
                    bridge.store_field(field, obj, value, &mut self.objects)?;
                }
                VmOp::LdSFld => {
                    let field = field_at(program, read_u32(code, f + 1), ip)?;
                    let value = bridge.load_static(field)?;
                    set!(f, from_native(value));
                }
                VmOp::StSFld => {
                    let field = field_at(program, read_u32(code, f + 1), ip)?;
                    let value = to_native(field.kind, r!(f));
                    bridge.store_static(field, value)?;
                }
            }
            ip = next;
        }
    }

    /// Read bridge-call arguments from the register window.
    fn marshal_out(&self, method: &MethodHandle, base: usize) -> Result<Vec<NativeValue>> {
        let mut args = Vec::with_capacity(method.params.len());
        for (i, &param) in method.params.iter().enumerate() {
            args.push(to_native(param, self.regs[base + i]));
        }
        Ok(args)
    }
}

/// Apply a branch displacement to an instruction start.
fn offset(ip: usize, disp: i32) -> usize {
    (ip as i64 + disp as i64) as usize
}

fn div_i32(a: i32, b: i32, ip: usize) -> Result<i32> {
    if b == 0 {
        return Err(Error::divide_by_zero(ip));
    }
    a.checked_div(b).ok_or_else(|| Error::overflow(ip))
}

fn rem_i32(a: i32, b: i32, ip: usize) -> Result<i32> {
    if b == 0 {
        return Err(Error::divide_by_zero(ip));
    }
    a.checked_rem(b).ok_or_else(|| Error::overflow(ip))
}

fn method_at(program: &Program, index: u32, ip: usize) -> Result<&MethodHandle> {
    program.tables.methods.get(index as usize).ok_or(Error::Fault {
        kind: FaultKind::BadMetadataIndex,
        offset: ip,
    })
}

fn field_at(program: &Program, index: u32, ip: usize) -> Result<&FieldHandle> {
    program.tables.fields.get(index as usize).ok_or(Error::Fault {
        kind: FaultKind::BadMetadataIndex,
        offset: ip,
    })
}

/// Object-table index behind a register value; zero is the null reference
fn handle_of(value: Value, ip: usize) -> Result<u32> {
    match value.as_handle() {
        0 => Err(Error::Fault {
            kind: FaultKind::BadObjectHandle,
            offset: ip,
        }),
        h => Ok(h - 1),
    }
}

fn to_native(kind: ParamKind, value: Value) -> NativeValue {
    match kind {
        ParamKind::Bool => NativeValue::Bool(value.as_i32() != 0),
        ParamKind::Int | ParamKind::Sbyte | ParamKind::Short => NativeValue::I32(value.as_i32()),
        ParamKind::Byte | ParamKind::UShort | ParamKind::UInt => NativeValue::U32(value.upper),
        ParamKind::Long => NativeValue::I64(value.as_i64()),
        ParamKind::ULong => NativeValue::U64(value.as_i64() as u64),
        ParamKind::Float => NativeValue::F32(value.as_f32()),
        ParamKind::Double => NativeValue::F64(value.as_f64()),
        ParamKind::Void => NativeValue::Null,
        _ => {
            if value.as_handle() == 0 {
                NativeValue::Null
            } else {
                NativeValue::Object(value.as_handle() - 1)
            }
        }
    }
}

fn from_native(value: NativeValue) -> Value {
    match value {
        NativeValue::Bool(b) => Value::from_i32(b as i32),
        NativeValue::I32(v) => Value::from_i32(v),
        NativeValue::I64(v) => Value::from_i64(v),
        NativeValue::U32(v) => Value::from_handle(v),
        NativeValue::U64(v) => Value::from_i64(v as i64),
        NativeValue::F32(v) => Value::from_f32(v),
        NativeValue::F64(v) => Value::from_f64(v),
        NativeValue::Object(h) => Value::from_handle(h + 1),
        NativeValue::Null => Value::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bridge::ClosedBridge;

    /// Hand-assemble a register-only program.
    fn program(code: Vec<u8>) -> Program {
        Program {
            name: "test".into(),
            code,
            tables: Default::default(),
            register_count: 8,
            arg_count: 0,
            void: false,
            block_starts: vec![0],
        }
    }

    fn op(code: &mut Vec<u8>, op: VmOp) {
        code.extend_from_slice(&(op as u16).to_le_bytes());
    }

    #[test]
    fn test_add_then_ret() {
        let mut code = Vec::new();
        op(&mut code, VmOp::AddI32);
        code.extend_from_slice(&[0, 1, 2]);
        op(&mut code, VmOp::Ret);

        let mut vm = Vm::new();
        vm.set_reg(1, Value::from_i32(3));
        vm.set_reg(2, Value::from_i32(2));
        let out = vm.run(&program(code), &mut ClosedBridge).unwrap();
        assert_eq!(out, Value { upper: 5, lower: 0 });
    }

    #[test]
    fn test_div_then_ret() {
        let mut code = Vec::new();
        op(&mut code, VmOp::DivI32);
        code.extend_from_slice(&[0, 1, 2]);
        op(&mut code, VmOp::Ret);

        let mut vm = Vm::new();
        vm.set_reg(1, Value::from_i32(10));
        vm.set_reg(2, Value::from_i32(5));
        let out = vm.run(&program(code), &mut ClosedBridge).unwrap();
        assert_eq!(out, Value { upper: 2, lower: 0 });
    }

    #[test]
    fn test_divide_by_zero_faults() {
        let mut code = Vec::new();
        op(&mut code, VmOp::DivI32);
        code.extend_from_slice(&[0, 1, 2]);
        op(&mut code, VmOp::Ret);

        let mut vm = Vm::new();
        vm.set_reg(1, Value::from_i32(1));
        let err = vm.run(&program(code), &mut ClosedBridge).unwrap_err();
        assert!(matches!(
            err,
            Error::Fault {
                kind: FaultKind::DivideByZero,
                offset: 0
            }
        ));
    }

    #[test]
    fn test_min_over_minus_one_faults() {
        let mut code = Vec::new();
        op(&mut code, VmOp::DivI32);
        code.extend_from_slice(&[0, 1, 2]);
        op(&mut code, VmOp::Ret);

        let mut vm = Vm::new();
        vm.set_reg(1, Value::from_i32(i32::MIN));
        vm.set_reg(2, Value::from_i32(-1));
        let err = vm.run(&program(code), &mut ClosedBridge).unwrap_err();
        assert!(err.is_fault());
    }

    #[test]
    fn test_checked_add_overflow_faults() {
        let mut code = Vec::new();
        op(&mut code, VmOp::AddI32Chk);
        code.extend_from_slice(&[0, 1, 2]);
        op(&mut code, VmOp::Ret);

        let mut vm = Vm::new();
        vm.set_reg(1, Value::from_i32(i32::MAX));
        vm.set_reg(2, Value::from_i32(1));
        let err = vm.run(&program(code), &mut ClosedBridge).unwrap_err();
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
        let mut code = Vec::new();
        op(&mut code, VmOp::AddI32);
        code.extend_from_slice(&[0, 1, 2]);
        op(&mut code, VmOp::Ret);

        let mut vm = Vm::new();
        vm.set_reg(1, Value::from_i32(i32::MAX));
        vm.set_reg(2, Value::from_i32(1));
        let out = vm.run(&program(code), &mut ClosedBridge).unwrap();
        assert_eq!(out.as_i32(), i32::MIN);
    }

    #[test]
    fn test_branch_and_loop() {
        // r0 = 0; r1 = 5; loop: r0 += r1; r1 -= 1; if r1 > 0 goto loop; ret
        let mut code = Vec::new();
        let loop_start = code.len();
        op(&mut code, VmOp::AddI32);
        code.extend_from_slice(&[0, 0, 1]);
        op(&mut code, VmOp::SubI32Imm);
        code.extend_from_slice(&[1, 1]);
        code.extend_from_slice(&1i32.to_le_bytes());
        let br_at = code.len();
        op(&mut code, VmOp::BrGtI32Imm);
        code.push(1);
        code.extend_from_slice(&0i32.to_le_bytes());
        code.extend_from_slice(&((loop_start as i64 - br_at as i64) as i32).to_le_bytes());
        op(&mut code, VmOp::Ret);

        let mut vm = Vm::new();
        vm.set_reg(1, Value::from_i32(5));
        let out = vm.run(&program(code), &mut ClosedBridge).unwrap();
        assert_eq!(out.as_i32(), 15);
    }

    #[test]
    fn test_invalid_opcode_faults() {
        let code = vec![0xFF, 0x7F];
        let err = Vm::new().run(&program(code), &mut ClosedBridge).unwrap_err();
        assert!(matches!(
            err,
            Error::Fault {
                kind: FaultKind::InvalidOpcode,
                ..
            }
        ));
    }

    #[test]
    fn test_bad_metadata_index_faults() {
        let mut code = Vec::new();
        op(&mut code, VmOp::CallNative);
        code.extend_from_slice(&[0, 0]);
        code.extend_from_slice(&9u32.to_le_bytes());
        op(&mut code, VmOp::Ret);
        let err = Vm::new().run(&program(code), &mut ClosedBridge).unwrap_err();
        assert!(matches!(
            err,
            Error::Fault {
                kind: FaultKind::BadMetadataIndex,
                ..
            }
        ));
    }

    #[test]
    fn test_i64_across_halves() {
        let mut code = Vec::new();
        op(&mut code, VmOp::LdcI64);
        code.push(1);
        code.extend_from_slice(&(1i64 << 40).to_le_bytes());
        op(&mut code, VmOp::LdcI64);
        code.push(2);
        code.extend_from_slice(&3i64.to_le_bytes());
        op(&mut code, VmOp::MulI64);
        code.extend_from_slice(&[0, 1, 2]);
        op(&mut code, VmOp::Ret);
        let out = Vm::new().run(&program(code), &mut ClosedBridge).unwrap();
        assert_eq!(out.as_i64(), 3i64 << 40);
    }
}
