//! Bytecode opcode set and encoding forms
//!
//! Opcodes are two-byte little-endian tags followed by a fixed operand
//! layout given by the opcode's [`Form`]. Register fields are one byte,
//! payloads are four or eight bytes; branch payloads hold an `i32`
//! displacement from the branch instruction's own first byte.
//!
//! Operations are typed at the opcode level (one add per value kind) so the
//! dispatch loop never inspects operand kinds at run time.

/// Operand layout of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    /// No operands
    Op,
    /// One register
    A,
    /// Two registers
    AB,
    /// Three registers
    ABC,
    /// One register, 4-byte payload
    AP,
    /// Two registers, 4-byte payload
    ABP,
    /// One register, two 4-byte payloads
    APP,
    /// One register, 8-byte payload
    ALP,
    /// 4-byte payload only
    P,
}

impl Form {
    /// Encoded instruction width in bytes, tag included
    pub fn width(self) -> usize {
        match self {
            Form::Op => 2,
            Form::A => 3,
            Form::AB => 4,
            Form::ABC => 5,
            Form::P => 6,
            Form::AP => 7,
            Form::ABP => 8,
            Form::APP => 11,
            Form::ALP => 11,
        }
    }
}

macro_rules! opcodes {
    ($($(#[$meta:meta])* $name:ident = $tag:literal => $form:ident),* $(,)?) => {
        /// A bytecode operation
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum VmOp {
            $($(#[$meta])* $name = $tag),*
        }

        impl VmOp {
            /// Decode a two-byte tag
            pub fn from_u16(raw: u16) -> Option<VmOp> {
                match raw {
                    $($tag => Some(VmOp::$name),)*
                    _ => None,
                }
            }

            /// Operand layout of this opcode
            pub fn form(self) -> Form {
                match self {
                    $(VmOp::$name => Form::$form),*
                }
            }
        }
    };
}

opcodes! {
    // ========== Control ==========
    Nop = 0x0000 => Op,
    /// Return; register 0 holds the result for non-void bodies
    Ret = 0x0001 => Op,
    Jmp = 0x0002 => P,
    Mov = 0x0003 => AB,

    // ========== Constants ==========
    LdcI32 = 0x0010 => AP,
    LdcI64 = 0x0011 => ALP,
    LdcF32 = 0x0012 => AP,
    LdcF64 = 0x0013 => ALP,
    LdNull = 0x0014 => A,

    // ========== Integer arithmetic ==========
    AddI32 = 0x0020 => ABC,
    SubI32 = 0x0021 => ABC,
    MulI32 = 0x0022 => ABC,
    DivI32 = 0x0023 => ABC,
    RemI32 = 0x0024 => ABC,
    AndI32 = 0x0025 => ABC,
    OrI32 = 0x0026 => ABC,
    XorI32 = 0x0027 => ABC,
    ShlI32 = 0x0028 => ABC,
    ShrI32 = 0x0029 => ABC,
    AddI64 = 0x0030 => ABC,
    SubI64 = 0x0031 => ABC,
    MulI64 = 0x0032 => ABC,
    DivI64 = 0x0033 => ABC,
    RemI64 = 0x0034 => ABC,
    AndI64 = 0x0035 => ABC,
    OrI64 = 0x0036 => ABC,
    XorI64 = 0x0037 => ABC,
    ShlI64 = 0x0038 => ABC,
    ShrI64 = 0x0039 => ABC,

    // ========== Float arithmetic ==========
    AddF32 = 0x0040 => ABC,
    SubF32 = 0x0041 => ABC,
    MulF32 = 0x0042 => ABC,
    DivF32 = 0x0043 => ABC,
    RemF32 = 0x0044 => ABC,
    AddF64 = 0x0048 => ABC,
    SubF64 = 0x0049 => ABC,
    MulF64 = 0x004A => ABC,
    DivF64 = 0x004B => ABC,
    RemF64 = 0x004C => ABC,

    // ========== Overflow-checked arithmetic ==========
    AddI32Chk = 0x0050 => ABC,
    SubI32Chk = 0x0051 => ABC,
    MulI32Chk = 0x0052 => ABC,
    AddI64Chk = 0x0053 => ABC,
    SubI64Chk = 0x0054 => ABC,
    MulI64Chk = 0x0055 => ABC,

    // ========== Immediate-operand arithmetic ==========
    AddI32Imm = 0x0058 => ABP,
    SubI32Imm = 0x0059 => ABP,
    MulI32Imm = 0x005A => ABP,

    // ========== Unary ==========
    NegI32 = 0x0060 => AB,
    NegI64 = 0x0061 => AB,
    NegF32 = 0x0062 => AB,
    NegF64 = 0x0063 => AB,
    NotI32 = 0x0064 => AB,
    NotI64 = 0x0065 => AB,

    // ========== Conversions ==========
    I32ToI64 = 0x0070 => AB,
    I32ToF32 = 0x0071 => AB,
    I32ToF64 = 0x0072 => AB,
    I64ToI32 = 0x0073 => AB,
    I64ToF32 = 0x0074 => AB,
    I64ToF64 = 0x0075 => AB,
    F32ToI32 = 0x0076 => AB,
    F32ToI64 = 0x0077 => AB,
    F32ToF64 = 0x0078 => AB,
    F64ToI32 = 0x0079 => AB,
    F64ToI64 = 0x007A => AB,
    F64ToF32 = 0x007B => AB,

    // ========== Comparisons (write 0 or 1) ==========
    CmpEqI32 = 0x0080 => ABC,
    CmpNeI32 = 0x0081 => ABC,
    CmpLtI32 = 0x0082 => ABC,
    CmpLeI32 = 0x0083 => ABC,
    CmpGtI32 = 0x0084 => ABC,
    CmpGeI32 = 0x0085 => ABC,
    CmpEqI64 = 0x0086 => ABC,
    CmpNeI64 = 0x0087 => ABC,
    CmpLtI64 = 0x0088 => ABC,
    CmpLeI64 = 0x0089 => ABC,
    CmpGtI64 = 0x008A => ABC,
    CmpGeI64 = 0x008B => ABC,
    CmpEqF32 = 0x008C => ABC,
    CmpNeF32 = 0x008D => ABC,
    CmpLtF32 = 0x008E => ABC,
    CmpLeF32 = 0x008F => ABC,
    CmpGtF32 = 0x0090 => ABC,
    CmpGeF32 = 0x0091 => ABC,
    CmpEqF64 = 0x0092 => ABC,
    CmpNeF64 = 0x0093 => ABC,
    CmpLtF64 = 0x0094 => ABC,
    CmpLeF64 = 0x0095 => ABC,
    CmpGtF64 = 0x0096 => ABC,
    CmpGeF64 = 0x0097 => ABC,
    CmpEqI32Imm = 0x0098 => ABP,
    CmpNeI32Imm = 0x0099 => ABP,
    CmpLtI32Imm = 0x009A => ABP,
    CmpLeI32Imm = 0x009B => ABP,
    CmpGtI32Imm = 0x009C => ABP,
    CmpGeI32Imm = 0x009D => ABP,

    // ========== Conditional branches ==========
    BrEqI32 = 0x00A0 => ABP,
    BrNeI32 = 0x00A1 => ABP,
    BrLtI32 = 0x00A2 => ABP,
    BrLeI32 = 0x00A3 => ABP,
    BrGtI32 = 0x00A4 => ABP,
    BrGeI32 = 0x00A5 => ABP,
    BrEqI64 = 0x00A6 => ABP,
    BrNeI64 = 0x00A7 => ABP,
    BrLtI64 = 0x00A8 => ABP,
    BrLeI64 = 0x00A9 => ABP,
    BrGtI64 = 0x00AA => ABP,
    BrGeI64 = 0x00AB => ABP,
    BrEqF32 = 0x00AC => ABP,
    BrNeF32 = 0x00AD => ABP,
    BrLtF32 = 0x00AE => ABP,
    BrLeF32 = 0x00AF => ABP,
    BrGtF32 = 0x00B0 => ABP,
    BrGeF32 = 0x00B1 => ABP,
    BrEqF64 = 0x00B2 => ABP,
    BrNeF64 = 0x00B3 => ABP,
    BrLtF64 = 0x00B4 => ABP,
    BrLeF64 = 0x00B5 => ABP,
    BrGtF64 = 0x00B6 => ABP,
    BrGeF64 = 0x00B7 => ABP,
    BrEqI32Imm = 0x00B8 => APP,
    BrNeI32Imm = 0x00B9 => APP,
    BrLtI32Imm = 0x00BA => APP,
    BrLeI32Imm = 0x00BB => APP,
    BrGtI32Imm = 0x00BC => APP,
    BrGeI32Imm = 0x00BD => APP,

    // ========== Bridge ==========
    /// a: result register (ignored for void callees), b: first argument
    /// register, payload: method table index
    CallNative = 0x00C0 => ABP,
    /// a: result register, b: first argument register, payload: method index
    NewObj = 0x00C1 => ABP,
    /// a: result, b: object handle, payload: field index
    LdFld = 0x00C2 => ABP,
    /// a: object handle, b: source, payload: field index
    StFld = 0x00C3 => ABP,
    /// a: result, payload: field index
    LdSFld = 0x00C4 => AP,
    /// a: source, payload: field index
    StSFld = 0x00C5 => AP,
}

// Little-endian field readers shared by the dispatch loop and the
// disassembler. Callers bound-check via instruction widths.

pub fn read_u16(code: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([code[at], code[at + 1]])
}

pub fn read_u32(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

pub fn read_i32(code: &[u8], at: usize) -> i32 {
    read_u32(code, at) as i32
}

pub fn read_u64(code: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&code[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for &op in &[VmOp::Nop, VmOp::AddI32, VmOp::BrGeI32Imm, VmOp::StSFld] {
            assert_eq!(VmOp::from_u16(op as u16), Some(op));
        }
        assert_eq!(VmOp::from_u16(0xFFFF), None);
        assert_eq!(VmOp::from_u16(0x001F), None);
    }

    #[test]
    fn test_widths() {
        assert_eq!(VmOp::Ret.form().width(), 2);
        assert_eq!(VmOp::LdNull.form().width(), 3);
        assert_eq!(VmOp::Mov.form().width(), 4);
        assert_eq!(VmOp::AddI32.form().width(), 5);
        assert_eq!(VmOp::Jmp.form().width(), 6);
        assert_eq!(VmOp::LdcI32.form().width(), 7);
        assert_eq!(VmOp::BrEqI32.form().width(), 8);
        assert_eq!(VmOp::LdcI64.form().width(), 11);
        assert_eq!(VmOp::BrEqI32Imm.form().width(), 11);
    }
}
