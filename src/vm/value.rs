//! Register cell representation
//!
//! Every register is a pair of 32-bit halves. 32-bit quantities (integers,
//! floats, object handles) live in the upper half with the lower half
//! cleared; 64-bit quantities span both, high bits in the upper half. The
//! halves are plain bit buckets: the instruction stream, not the cell,
//! decides how to view them.

/// One VM register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Value {
    pub upper: u32,
    pub lower: u32,
}

impl Value {
    pub const ZERO: Value = Value { upper: 0, lower: 0 };

    // ========== 32-bit views (upper half) ==========

    pub fn from_i32(v: i32) -> Self {
        Value {
            upper: v as u32,
            lower: 0,
        }
    }

    pub fn as_i32(self) -> i32 {
        self.upper as i32
    }

    pub fn from_f32(v: f32) -> Self {
        Value {
            upper: v.to_bits(),
            lower: 0,
        }
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.upper)
    }

    /// Object-table handle
    pub fn from_handle(h: u32) -> Self {
        Value { upper: h, lower: 0 }
    }

    pub fn as_handle(self) -> u32 {
        self.upper
    }

    // ========== 64-bit views (both halves) ==========

    pub fn from_i64(v: i64) -> Self {
        let bits = v as u64;
        Value {
            upper: (bits >> 32) as u32,
            lower: bits as u32,
        }
    }

    pub fn as_i64(self) -> i64 {
        (((self.upper as u64) << 32) | self.lower as u64) as i64
    }

    pub fn from_f64(v: f64) -> Self {
        let bits = v.to_bits();
        Value {
            upper: (bits >> 32) as u32,
            lower: bits as u32,
        }
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(((self.upper as u64) << 32) | self.lower as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i32_roundtrip() {
        let v = Value::from_i32(-5);
        assert_eq!(v.as_i32(), -5);
        assert_eq!(v.lower, 0);
        assert_eq!(Value::from_i32(5).upper, 5);
    }

    #[test]
    fn test_i64_spans_both_halves() {
        let v = Value::from_i64(0x1234_5678_9abc_def0);
        assert_eq!(v.upper, 0x1234_5678);
        assert_eq!(v.lower, 0x9abc_def0);
        assert_eq!(v.as_i64(), 0x1234_5678_9abc_def0);
        assert_eq!(Value::from_i64(-1).as_i64(), -1);
    }

    #[test]
    fn test_float_bits() {
        assert_eq!(Value::from_f32(1.5).as_f32(), 1.5);
        assert_eq!(Value::from_f64(-2.25).as_f64(), -2.25);
        // NaN payloads survive since only bits move.
        let nan = Value::from_f64(f64::NAN);
        assert!(nan.as_f64().is_nan());
    }
}
