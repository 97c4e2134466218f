//! Native-call bridge and metadata side tables
//!
//! Calls to methods outside the compiled unit leave the VM through the
//! [`NativeBridge`] trait: the interpreter reads arguments from a contiguous
//! register range according to the callee's parameter-kind descriptor,
//! boxes/unboxes object handles against the [`ObjectTable`], invokes the
//! bridge, and writes the result (and any by-reference outputs) back.
//!
//! The side tables are produced at patch-build time by the external symbol
//! resolver and consumed here by dense index; the reflection machinery that
//! resolves them is out of scope.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Parameter kind tags for marshaling between registers and native values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Bool,
    Int,
    Sbyte,
    Byte,
    Short,
    UShort,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    Object,
    Void,
    LocalPointer,
    InstanceFieldPointer,
    StaticFieldPointer,
    ArrayPointer,
    ObjectPointer,
}

impl ParamKind {
    /// True for kinds passed back by reference (written to the register file
    /// and object table after the call returns)
    pub fn is_by_ref(&self) -> bool {
        matches!(
            self,
            ParamKind::LocalPointer
                | ParamKind::InstanceFieldPointer
                | ParamKind::StaticFieldPointer
                | ParamKind::ArrayPointer
                | ParamKind::ObjectPointer
        )
    }
}

/// A resolved type reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeHandle {
    pub name: String,
}

/// A resolved method reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodHandle {
    pub name: String,
    /// Constructors allocate their receiver instead of taking one
    pub is_ctor: bool,
    /// Parameter kinds in register order (receiver first for instance methods)
    pub params: Vec<ParamKind>,
    /// Return kind (`Void` for none)
    pub ret: ParamKind,
}

impl MethodHandle {
    /// A static method with the given signature
    pub fn new(name: impl Into<String>, params: Vec<ParamKind>, ret: ParamKind) -> Self {
        MethodHandle {
            name: name.into(),
            is_ctor: false,
            params,
            ret,
        }
    }

    /// A constructor taking the given parameters
    pub fn ctor(name: impl Into<String>, params: Vec<ParamKind>) -> Self {
        MethodHandle {
            name: name.into(),
            is_ctor: true,
            params,
            ret: ParamKind::Object,
        }
    }

    /// True if the call pushes a result
    pub fn returns_value(&self) -> bool {
        self.ret != ParamKind::Void
    }
}

/// A resolved field reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldHandle {
    pub name: String,
    pub kind: ParamKind,
    pub is_static: bool,
}

/// The ordered metadata side tables for one compiled unit
///
/// Instructions reference entries by dense index, never by name; name lookup
/// only happens at patch-build time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolTables {
    pub types: Vec<TypeHandle>,
    pub methods: Vec<MethodHandle>,
    pub fields: Vec<FieldHandle>,
}

impl SymbolTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, returning its dense index
    pub fn add_method(&mut self, method: MethodHandle) -> u32 {
        self.methods.push(method);
        (self.methods.len() - 1) as u32
    }

    /// Register a field, returning its dense index
    pub fn add_field(&mut self, field: FieldHandle) -> u32 {
        self.fields.push(field);
        (self.fields.len() - 1) as u32
    }

    /// Register a type, returning its dense index
    pub fn add_type(&mut self, ty: TypeHandle) -> u32 {
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }

    /// Resolve a method by name
    pub fn method_index(&self, name: &str) -> Result<u32> {
        self.methods
            .iter()
            .position(|m| m.name == name)
            .map(|i| i as u32)
            .ok_or_else(|| Error::unresolved_method(name))
    }

    /// Resolve a field by name
    pub fn field_index(&self, name: &str) -> Result<u32> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as u32)
            .ok_or_else(|| Error::unresolved_field(name))
    }

    /// Look up a method by index
    pub fn method(&self, index: u32) -> Result<&MethodHandle> {
        self.methods
            .get(index as usize)
            .ok_or_else(|| Error::InternalError(format!("method index {} out of range", index)))
    }

    /// Look up a field by index
    pub fn field(&self, index: u32) -> Result<&FieldHandle> {
        self.fields
            .get(index as usize)
            .ok_or_else(|| Error::InternalError(format!("field index {} out of range", index)))
    }
}

/// A marshaled native value crossing the bridge
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Index into the object table
    Object(u32),
    Null,
}

/// Result of a bridged call
#[derive(Debug, Clone, Default)]
pub struct NativeReturn {
    /// The return value, if the callee returns one
    pub value: Option<NativeValue>,
    /// By-reference outputs: (argument position, new value), written back to
    /// the argument's register after the call
    pub writebacks: Vec<(usize, NativeValue)>,
}

impl NativeReturn {
    /// A plain value return
    pub fn value(value: NativeValue) -> Self {
        NativeReturn {
            value: Some(value),
            writebacks: Vec::new(),
        }
    }

    /// A void return
    pub fn void() -> Self {
        NativeReturn::default()
    }
}

/// Side table of live host objects, indexed by register value
///
/// The VM never owns or collects these; entries are handles whose lifetime is
/// managed by the host runtime. The table lives as long as one VM invocation.
#[derive(Default)]
pub struct ObjectTable {
    entries: Vec<Option<Box<dyn Any>>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object, returning its handle
    pub fn insert(&mut self, object: Box<dyn Any>) -> u32 {
        self.entries.push(Some(object));
        (self.entries.len() - 1) as u32
    }

    /// Borrow the object behind a handle
    pub fn get(&self, handle: u32) -> Option<&dyn Any> {
        self.entries
            .get(handle as usize)
            .and_then(|slot| slot.as_deref())
    }

    /// Mutably borrow the object behind a handle
    pub fn get_mut(&mut self, handle: u32) -> Option<&mut (dyn Any + 'static)> {
        self.entries
            .get_mut(handle as usize)
            .and_then(|slot| slot.as_deref_mut())
    }

    /// Release a handle back to the host
    pub fn remove(&mut self, handle: u32) -> Option<Box<dyn Any>> {
        self.entries.get_mut(handle as usize).and_then(Option::take)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host-side implementation of out-of-unit calls and field access
///
/// The compiled unit never touches host memory directly; every escape goes
/// through one of these methods with marshaled values.
pub trait NativeBridge {
    /// Invoke a method outside the compiled unit
    fn invoke(
        &mut self,
        method: &MethodHandle,
        args: &[NativeValue],
        objects: &mut ObjectTable,
    ) -> Result<NativeReturn>;

    /// Allocate an object and run its constructor, returning the new handle
    fn construct(
        &mut self,
        ctor: &MethodHandle,
        args: &[NativeValue],
        objects: &mut ObjectTable,
    ) -> Result<u32>;

    /// Read an instance field
    fn load_field(
        &mut self,
        field: &FieldHandle,
        obj: u32,
        objects: &mut ObjectTable,
    ) -> Result<NativeValue>;

    /// Write an instance field
    fn store_field(
        &mut self,
        field: &FieldHandle,
        obj: u32,
        value: NativeValue,
        objects: &mut ObjectTable,
    ) -> Result<()>;

    /// Read a static field
    fn load_static(&mut self, field: &FieldHandle) -> Result<NativeValue>;

    /// Write a static field
    fn store_static(&mut self, field: &FieldHandle, value: NativeValue) -> Result<()>;
}

/// A bridge for methods that never leave the compiled unit; any escape is an
/// unresolved-symbol error
#[derive(Debug, Default)]
pub struct ClosedBridge;

impl NativeBridge for ClosedBridge {
    fn invoke(
        &mut self,
        method: &MethodHandle,
        _args: &[NativeValue],
        _objects: &mut ObjectTable,
    ) -> Result<NativeReturn> {
        Err(Error::unresolved_method(&method.name))
    }

    fn construct(
        &mut self,
        ctor: &MethodHandle,
        _args: &[NativeValue],
        _objects: &mut ObjectTable,
    ) -> Result<u32> {
        Err(Error::unresolved_method(&ctor.name))
    }

    fn load_field(
        &mut self,
        field: &FieldHandle,
        _obj: u32,
        _objects: &mut ObjectTable,
    ) -> Result<NativeValue> {
        Err(Error::unresolved_field(&field.name))
    }

    fn store_field(
        &mut self,
        field: &FieldHandle,
        _obj: u32,
        _value: NativeValue,
        _objects: &mut ObjectTable,
    ) -> Result<()> {
        Err(Error::unresolved_field(&field.name))
    }

    fn load_static(&mut self, field: &FieldHandle) -> Result<NativeValue> {
        Err(Error::unresolved_field(&field.name))
    }

    fn store_static(&mut self, field: &FieldHandle, _value: NativeValue) -> Result<()> {
        Err(Error::unresolved_field(&field.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_tables() {
        let mut tables = SymbolTables::new();
        let idx = tables.add_method(MethodHandle::new(
            "Math::Max",
            vec![ParamKind::Int, ParamKind::Int],
            ParamKind::Int,
        ));
        assert_eq!(idx, 0);
        assert_eq!(tables.method_index("Math::Max").unwrap(), 0);
        assert!(tables.method_index("Math::Min").is_err());
        assert!(tables.method(0).unwrap().returns_value());
    }

    #[test]
    fn test_object_table() {
        let mut objects = ObjectTable::new();
        let handle = objects.insert(Box::new(42u64));
        assert_eq!(objects.get(handle).unwrap().downcast_ref::<u64>(), Some(&42));
        assert_eq!(objects.len(), 1);
        objects.remove(handle);
        assert!(objects.get(handle).is_none());
        assert!(objects.is_empty());
    }
}
