//! The metadata queries the graph builder needs from its caller.
//!
//! The crate never reads metadata tables itself. Everything the control/data-flow graph needs to
//! know about the tokens that appear in a method body (call signatures, field types, the types
//! named by `newarr`, `box`, `castclass` and friends) is asked from a [`MetadataHost`].
//! [`SimpleHost`] is a map-backed implementation for callers that resolve tokens up front and
//! for tests.
//!
//! # Examples
//!
//! ```rust
//! use dotsym::host::{MetadataHost, MethodSignature, SimpleHost, TypeRef};
//! use dotsym::token::Token;
//!
//! let concat = Token(0x0A00_0010);
//! let host = SimpleHost::new().with_method(
//!     concat,
//!     MethodSignature::new(TypeRef::String, vec![TypeRef::String, TypeRef::String]),
//! );
//!
//! let signature = host.method_signature(concat).unwrap();
//! assert_eq!(signature.argument_count(), 2);
//! assert!(signature.returns_value());
//! assert!(host.is_reference_type(&TypeRef::String));
//! ```

use std::{collections::HashMap, fmt};

use crate::token::Token;

/// A type as far as stack and local typing is concerned.
///
/// Types the caller knows by token only are [`TypeRef::Named`]; the flag tells whether the type
/// is a value type, which decides how two differing types merge at a join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TypeRef {
    /// No value
    Void,
    /// `System.Boolean`
    Boolean,
    /// `System.Char`
    Char,
    /// `System.SByte`
    I8,
    /// `System.Byte`
    U8,
    /// `System.Int16`
    I16,
    /// `System.UInt16`
    U16,
    /// `System.Int32`
    I32,
    /// `System.UInt32`
    U32,
    /// `System.Int64`
    I64,
    /// `System.UInt64`
    U64,
    /// `System.IntPtr`
    NativeInt,
    /// `System.UIntPtr`
    NativeUInt,
    /// `System.Single`
    F32,
    /// `System.Double`
    F64,
    /// `System.String`
    String,
    /// `System.Object`
    Object,
    /// `System.TypedReference`
    TypedReference,
    /// `System.RuntimeTypeHandle`
    TypeHandle,
    /// `System.RuntimeFieldHandle`
    FieldHandle,
    /// `System.RuntimeMethodHandle`
    MethodHandle,
    /// `System.RuntimeArgumentHandle`
    ArgumentHandle,
    /// A type defined or referenced by a metadata token
    Named {
        /// `TypeDef`, `TypeRef` or `TypeSpec` token
        token: Token,
        /// True for structs and enums
        is_value_type: bool,
    },
    /// Array of the element type with the given rank (1 for vectors)
    Array(Box<TypeRef>, u32),
    /// Unmanaged pointer
    Pointer(Box<TypeRef>),
    /// Managed pointer (`ref`, `out`, `ldloca` results)
    ManagedPointer(Box<TypeRef>),
    /// Not known, either unresolved or conflicting
    #[default]
    Unknown,
}

impl TypeRef {
    /// A reference type known by token
    #[must_use]
    pub fn class(token: Token) -> Self {
        TypeRef::Named {
            token,
            is_value_type: false,
        }
    }

    /// A value type known by token
    #[must_use]
    pub fn value_type(token: Token) -> Self {
        TypeRef::Named {
            token,
            is_value_type: true,
        }
    }

    /// Vector of `element`
    #[must_use]
    pub fn vector(element: TypeRef) -> Self {
        TypeRef::Array(Box::new(element), 1)
    }

    /// Managed pointer to `target`
    #[must_use]
    pub fn by_ref(target: TypeRef) -> Self {
        TypeRef::ManagedPointer(Box::new(target))
    }

    /// True for [`TypeRef::Void`]
    #[must_use]
    pub const fn is_void(&self) -> bool {
        matches!(self, TypeRef::Void)
    }

    /// True for [`TypeRef::Unknown`]
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, TypeRef::Unknown)
    }

    /// True for managed and unmanaged pointers
    #[must_use]
    pub const fn is_pointer(&self) -> bool {
        matches!(self, TypeRef::Pointer(_) | TypeRef::ManagedPointer(_))
    }

    /// The type a pointer or managed pointer refers to
    #[must_use]
    pub fn pointee(&self) -> Option<&TypeRef> {
        match self {
            TypeRef::Pointer(target) | TypeRef::ManagedPointer(target) => Some(target),
            _ => None,
        }
    }

    /// The element type of an array
    #[must_use]
    pub fn element(&self) -> Option<&TypeRef> {
        match self {
            TypeRef::Array(element, _) => Some(element),
            _ => None,
        }
    }

    /// The type a value of this type has on the evaluation stack: small integers widen to
    /// `I32`, `U64` to `I64`, `NativeUInt` to `NativeInt` and floats to `F64`.
    #[must_use]
    pub fn stack_type(&self) -> TypeRef {
        match self {
            TypeRef::Boolean
            | TypeRef::Char
            | TypeRef::I8
            | TypeRef::U8
            | TypeRef::I16
            | TypeRef::U16
            | TypeRef::I32
            | TypeRef::U32 => TypeRef::I32,
            TypeRef::I64 | TypeRef::U64 => TypeRef::I64,
            TypeRef::NativeInt | TypeRef::NativeUInt => TypeRef::NativeInt,
            TypeRef::F32 | TypeRef::F64 => TypeRef::F64,
            other => other.clone(),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => f.write_str("void"),
            TypeRef::Boolean => f.write_str("bool"),
            TypeRef::Char => f.write_str("char"),
            TypeRef::I8 => f.write_str("int8"),
            TypeRef::U8 => f.write_str("uint8"),
            TypeRef::I16 => f.write_str("int16"),
            TypeRef::U16 => f.write_str("uint16"),
            TypeRef::I32 => f.write_str("int32"),
            TypeRef::U32 => f.write_str("uint32"),
            TypeRef::I64 => f.write_str("int64"),
            TypeRef::U64 => f.write_str("uint64"),
            TypeRef::NativeInt => f.write_str("native int"),
            TypeRef::NativeUInt => f.write_str("native uint"),
            TypeRef::F32 => f.write_str("float32"),
            TypeRef::F64 => f.write_str("float64"),
            TypeRef::String => f.write_str("string"),
            TypeRef::Object => f.write_str("object"),
            TypeRef::TypedReference => f.write_str("typedref"),
            TypeRef::TypeHandle => f.write_str("RuntimeTypeHandle"),
            TypeRef::FieldHandle => f.write_str("RuntimeFieldHandle"),
            TypeRef::MethodHandle => f.write_str("RuntimeMethodHandle"),
            TypeRef::ArgumentHandle => f.write_str("RuntimeArgumentHandle"),
            TypeRef::Named {
                token,
                is_value_type: true,
            } => write!(f, "valuetype {token}"),
            TypeRef::Named { token, .. } => write!(f, "class {token}"),
            TypeRef::Array(element, 1) => write!(f, "{element}[]"),
            TypeRef::Array(element, rank) => {
                write!(f, "{element}[{}]", ",".repeat((*rank as usize).saturating_sub(1)))
            }
            TypeRef::Pointer(target) => write!(f, "{target}*"),
            TypeRef::ManagedPointer(target) => write!(f, "{target}&"),
            TypeRef::Unknown => f.write_str("?"),
        }
    }
}

/// Parameters and return type of a method or call site.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodSignature {
    /// Instance method, `this` is passed before the parameters
    pub has_this: bool,
    /// Return type, [`TypeRef::Void`] for none
    pub return_type: TypeRef,
    /// Declared parameters, `this` excluded
    pub parameters: Vec<TypeRef>,
}

impl MethodSignature {
    /// A static signature
    #[must_use]
    pub fn new(return_type: TypeRef, parameters: Vec<TypeRef>) -> Self {
        MethodSignature {
            has_this: false,
            return_type,
            parameters,
        }
    }

    /// An instance signature
    #[must_use]
    pub fn instance(return_type: TypeRef, parameters: Vec<TypeRef>) -> Self {
        MethodSignature {
            has_this: true,
            return_type,
            parameters,
        }
    }

    /// True unless the return type is void
    #[must_use]
    pub fn returns_value(&self) -> bool {
        !self.return_type.is_void()
    }

    /// Values a call pops: the parameters plus `this` for instance methods
    #[must_use]
    pub fn argument_count(&self) -> usize {
        self.parameters.len() + usize::from(self.has_this)
    }
}

/// The method a graph is built for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodContext {
    /// `MethodDef` token of the method
    pub token: Token,
    /// Type of `this` for instance methods
    pub declaring_type: TypeRef,
    /// The method's own signature
    pub signature: MethodSignature,
    /// Types of the locals, by index
    pub locals: Vec<TypeRef>,
}

impl MethodContext {
    /// A context for `token` with the given signature and locals
    #[must_use]
    pub fn new(token: Token, signature: MethodSignature, locals: Vec<TypeRef>) -> Self {
        MethodContext {
            token,
            declaring_type: TypeRef::Object,
            signature,
            locals,
        }
    }

    /// Type of argument `index`, counting `this` as argument 0 on instance methods
    #[must_use]
    pub fn argument_type(&self, index: u16) -> TypeRef {
        let index = usize::from(index);
        if self.signature.has_this {
            match index {
                0 => self.declaring_type.clone(),
                _ => self
                    .signature
                    .parameters
                    .get(index - 1)
                    .cloned()
                    .unwrap_or_default(),
            }
        } else {
            self.signature
                .parameters
                .get(index)
                .cloned()
                .unwrap_or_default()
        }
    }

    /// Type of local `index`
    #[must_use]
    pub fn local_type(&self, index: u16) -> TypeRef {
        self.locals
            .get(usize::from(index))
            .cloned()
            .unwrap_or_default()
    }
}

/// Read-only metadata queries used while building graphs.
///
/// Every lookup returns `None` for tokens the host can not resolve; the graph builder then
/// types the affected values as [`TypeRef::Unknown`]. Only the pop count of a call depends
/// on [`MetadataHost::method_signature`], which makes it the one query the builder can not do
/// without.
pub trait MetadataHost {
    /// Signature of the method named by a `MethodDef`, `MemberRef` or `MethodSpec` token
    fn method_signature(&self, method: Token) -> Option<MethodSignature>;

    /// Type of the field named by a `Field` or `MemberRef` token
    fn field_type(&self, field: Token) -> Option<TypeRef>;

    /// The type named by a `TypeDef`, `TypeRef` or `TypeSpec` token
    fn resolve_type(&self, ty: Token) -> Option<TypeRef>;

    /// Call site signature named by a `StandAloneSig` token (`calli`)
    fn standalone_signature(&self, signature: Token) -> Option<MethodSignature>;

    /// Type that declares the method, used as the type of `newobj` results
    fn declaring_type(&self, _method: Token) -> Option<TypeRef> {
        None
    }

    /// True for types whose values are object references
    fn is_reference_type(&self, ty: &TypeRef) -> bool {
        match ty {
            TypeRef::String | TypeRef::Object | TypeRef::Array(..) => true,
            TypeRef::Named { is_value_type, .. } => !is_value_type,
            _ => false,
        }
    }

    /// Closest common base class of two reference types
    fn common_base(&self, _left: &TypeRef, _right: &TypeRef) -> TypeRef {
        TypeRef::Object
    }
}

/// A [`MetadataHost`] backed by hash maps filled in by the caller.
#[derive(Debug, Clone, Default)]
pub struct SimpleHost {
    methods: HashMap<Token, (MethodSignature, Option<TypeRef>)>,
    fields: HashMap<Token, TypeRef>,
    types: HashMap<Token, TypeRef>,
    signatures: HashMap<Token, MethodSignature>,
}

impl SimpleHost {
    /// An empty host
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method signature
    #[must_use]
    pub fn with_method(mut self, method: Token, signature: MethodSignature) -> Self {
        self.methods.insert(method, (signature, None));
        self
    }

    /// Register a constructor of `declaring_type`
    #[must_use]
    pub fn with_constructor(
        mut self,
        constructor: Token,
        signature: MethodSignature,
        declaring_type: TypeRef,
    ) -> Self {
        self.methods
            .insert(constructor, (signature, Some(declaring_type)));
        self
    }

    /// Register a field type
    #[must_use]
    pub fn with_field(mut self, field: Token, ty: TypeRef) -> Self {
        self.fields.insert(field, ty);
        self
    }

    /// Register the type behind a type token
    #[must_use]
    pub fn with_type(mut self, token: Token, ty: TypeRef) -> Self {
        self.types.insert(token, ty);
        self
    }

    /// Register a `calli` call site signature
    #[must_use]
    pub fn with_signature(mut self, signature: Token, method: MethodSignature) -> Self {
        self.signatures.insert(signature, method);
        self
    }
}

impl MetadataHost for SimpleHost {
    fn method_signature(&self, method: Token) -> Option<MethodSignature> {
        self.methods
            .get(&method)
            .map(|(signature, _)| signature.clone())
    }

    fn field_type(&self, field: Token) -> Option<TypeRef> {
        self.fields.get(&field).cloned()
    }

    fn resolve_type(&self, ty: Token) -> Option<TypeRef> {
        self.types.get(&ty).cloned()
    }

    fn standalone_signature(&self, signature: Token) -> Option<MethodSignature> {
        self.signatures.get(&signature).cloned()
    }

    fn declaring_type(&self, method: Token) -> Option<TypeRef> {
        self.methods
            .get(&method)
            .and_then(|(_, declaring)| declaring.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_types() {
        assert_eq!(TypeRef::Boolean.stack_type(), TypeRef::I32);
        assert_eq!(TypeRef::U16.stack_type(), TypeRef::I32);
        assert_eq!(TypeRef::U64.stack_type(), TypeRef::I64);
        assert_eq!(TypeRef::NativeUInt.stack_type(), TypeRef::NativeInt);
        assert_eq!(TypeRef::F32.stack_type(), TypeRef::F64);
        assert_eq!(TypeRef::String.stack_type(), TypeRef::String);
    }

    #[test]
    fn reference_types_by_shape() {
        let host = SimpleHost::new();
        assert!(host.is_reference_type(&TypeRef::Object));
        assert!(host.is_reference_type(&TypeRef::vector(TypeRef::I32)));
        assert!(host.is_reference_type(&TypeRef::class(Token(0x0200_0002))));
        assert!(!host.is_reference_type(&TypeRef::value_type(Token(0x0200_0003))));
        assert!(!host.is_reference_type(&TypeRef::I32));
        assert!(!host.is_reference_type(&TypeRef::by_ref(TypeRef::Object)));
        assert_eq!(
            host.common_base(&TypeRef::String, &TypeRef::vector(TypeRef::U8)),
            TypeRef::Object
        );
    }

    #[test]
    fn context_arguments() {
        let instance = MethodContext {
            declaring_type: TypeRef::class(Token(0x0200_0002)),
            ..MethodContext::new(
                Token(0x0600_0001),
                MethodSignature::instance(TypeRef::Void, vec![TypeRef::I64]),
                vec![TypeRef::String],
            )
        };
        assert_eq!(instance.argument_type(0), TypeRef::class(Token(0x0200_0002)));
        assert_eq!(instance.argument_type(1), TypeRef::I64);
        assert_eq!(instance.argument_type(2), TypeRef::Unknown);
        assert_eq!(instance.local_type(0), TypeRef::String);
        assert_eq!(instance.local_type(1), TypeRef::Unknown);

        let method = MethodContext::new(
            Token(0x0600_0002),
            MethodSignature::new(TypeRef::I32, vec![TypeRef::F64]),
            Vec::new(),
        );
        assert_eq!(method.argument_type(0), TypeRef::F64);
        assert_eq!(method.signature.argument_count(), 1);
    }

    #[test]
    fn simple_host_lookups() {
        let ctor = Token(0x0600_0010);
        let host = SimpleHost::new()
            .with_constructor(
                ctor,
                MethodSignature::instance(TypeRef::Void, vec![TypeRef::I32]),
                TypeRef::class(Token(0x0200_0004)),
            )
            .with_field(Token(0x0400_0001), TypeRef::I64)
            .with_type(Token(0x0100_0005), TypeRef::String)
            .with_signature(
                Token(0x1100_0001),
                MethodSignature::new(TypeRef::Void, Vec::new()),
            );

        assert_eq!(host.method_signature(ctor).unwrap().argument_count(), 2);
        assert_eq!(
            host.declaring_type(ctor),
            Some(TypeRef::class(Token(0x0200_0004)))
        );
        assert_eq!(host.field_type(Token(0x0400_0001)), Some(TypeRef::I64));
        assert_eq!(host.resolve_type(Token(0x0100_0005)), Some(TypeRef::String));
        assert!(host.standalone_signature(Token(0x1100_0001)).is_some());
        assert_eq!(host.method_signature(Token(0x0A00_0001)), None);
    }

    #[test]
    fn display() {
        assert_eq!(TypeRef::vector(TypeRef::I32).to_string(), "int32[]");
        assert_eq!(
            TypeRef::Array(Box::new(TypeRef::Object), 3).to_string(),
            "object[,,]"
        );
        assert_eq!(TypeRef::by_ref(TypeRef::I64).to_string(), "int64&");
        assert_eq!(
            TypeRef::value_type(Token(0x0200_0001)).to_string(),
            "valuetype 0x02000001"
        );
    }
}
