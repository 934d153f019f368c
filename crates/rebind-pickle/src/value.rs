//! Decoded pickle values
//!
//! Immutable values ([`Value`]) are held inline. Objects whose identity
//! matters to the memo (lists, dicts, sets and reconstructed instances)
//! live in a [`Heap`] and are referred to through [`Value::Ref`], so a
//! record that shares an object between two places keeps sharing it when
//! it is written back.

use std::fmt;

/// Reference to a class or function by module and qualified name
///
/// A global may be tagged as broken: it names a type the host could not
/// locate. Broken globals are written back exactly like resolved ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Global {
    module: String,
    name: String,
    broken: bool,
}

impl Global {
    /// Create a resolved global
    #[inline]
    #[must_use]
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            broken: false,
        }
    }

    /// Create a global for a type that could not be located
    #[inline]
    #[must_use]
    pub fn broken(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            broken: true,
        }
    }

    /// Module part
    #[inline]
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Name part
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this global stands in for a missing type
    #[inline]
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Whether module and name match
    #[inline]
    #[must_use]
    pub fn is(&self, module: &str, name: &str) -> bool {
        self.module == module && self.name == name
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Handle to an object stored in a [`Heap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(usize);

impl ObjId {
    /// Position of the object in its heap
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A decoded pickle value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `None`
    None,
    /// Boolean
    Bool(bool),
    /// Integer that fits in 64 bits
    Int(i64),
    /// Wider integer, little-endian two's complement
    Long(Vec<u8>),
    /// Double precision float
    Float(f64),
    /// Text string
    Str(String),
    /// Byte string (protocol 3 `bytes`)
    Bytes(Vec<u8>),
    /// Protocol 2 byte string whose text encoding is unknown
    LegacyString(Vec<u8>),
    /// Mutable byte buffer
    ByteArray(Vec<u8>),
    /// Tuple
    Tuple(Vec<Value>),
    /// Class or function reference
    Global(Global),
    /// Identity-bearing object in the heap
    Ref(ObjId),
    /// Persistent reference; the payload is the persistent id
    Persistent(Box<Value>),
}

impl Value {
    /// Text string value
    #[inline]
    #[must_use]
    pub fn str(text: impl Into<String>) -> Self {
        Self::Str(text.into())
    }

    /// Whether this is `None`
    #[inline]
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Borrow as text
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Borrow the raw bytes of any string-like value
    ///
    /// Text is returned as its UTF-8 encoding.
    #[must_use]
    pub fn string_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Str(text) => Some(text.as_bytes()),
            Self::Bytes(bytes) | Self::LegacyString(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Whether this is text or a legacy string equal to `text`
    #[must_use]
    pub fn is_text(&self, text: &str) -> bool {
        match self {
            Self::Str(value) => value == text,
            Self::LegacyString(bytes) => bytes.as_slice() == text.as_bytes(),
            _ => false,
        }
    }

    /// Borrow as a global
    #[inline]
    #[must_use]
    pub fn as_global(&self) -> Option<&Global> {
        match self {
            Self::Global(global) => Some(global),
            _ => None,
        }
    }

    /// Borrow tuple items
    #[inline]
    #[must_use]
    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Heap handle, if this value is a reference
    #[inline]
    #[must_use]
    pub fn as_ref_id(&self) -> Option<ObjId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::Long(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::LegacyString(_) => "legacy string",
            Self::ByteArray(_) => "bytearray",
            Self::Tuple(_) => "tuple",
            Self::Global(_) => "global",
            Self::Ref(_) => "object",
            Self::Persistent(_) => "persistent reference",
        }
    }
}

impl From<Global> for Value {
    fn from(global: Global) -> Self {
        Self::Global(global)
    }
}

/// How an instance was reconstructed
#[derive(Debug, Clone, PartialEq)]
pub enum Construct {
    /// `callable(*args)` through `REDUCE`
    Reduce {
        /// Callable, usually a global
        callable: Value,
        /// Argument tuple
        args: Value,
    },
    /// `cls.__new__(cls, *args)` through `NEWOBJ`
    NewObj {
        /// Class
        class: Value,
        /// Argument tuple
        args: Value,
    },
    /// `cls.__new__(cls, *args, **kwargs)` through `NEWOBJ_EX`
    NewObjEx {
        /// Class
        class: Value,
        /// Argument tuple
        args: Value,
        /// Keyword argument dict
        kwargs: Value,
    },
    /// Classic instance through `INST` or `OBJ`
    Inst {
        /// Class
        class: Value,
        /// Positional arguments
        args: Vec<Value>,
    },
}

impl Construct {
    /// The class or callable that builds the instance
    #[must_use]
    pub fn factory(&self) -> &Value {
        match self {
            Self::Reduce { callable, .. } => callable,
            Self::NewObj { class, .. } | Self::NewObjEx { class, .. } | Self::Inst { class, .. } => {
                class
            }
        }
    }
}

/// A reconstructed instance together with the items and state applied to it
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Construction step
    pub construct: Construct,
    /// Items added through `APPEND`/`APPENDS`
    pub list_items: Vec<Value>,
    /// Items added through `SETITEM`/`SETITEMS`
    pub dict_items: Vec<(Value, Value)>,
    /// Arguments of every `BUILD`, in order
    pub state: Vec<Value>,
}

impl Instance {
    /// Instance with no items and no state
    #[must_use]
    pub fn new(construct: Construct) -> Self {
        Self {
            construct,
            list_items: Vec::new(),
            dict_items: Vec::new(),
            state: Vec::new(),
        }
    }
}

/// Heap object
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// List
    List(Vec<Value>),
    /// Dict, insertion ordered
    Dict(Vec<(Value, Value)>),
    /// Set
    Set(Vec<Value>),
    /// Frozen set
    FrozenSet(Vec<Value>),
    /// Reconstructed instance
    Instance(Instance),
}

/// Arena of identity-bearing objects belonging to one record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heap {
    objects: Vec<Object>,
}

impl Heap {
    /// Create empty heap
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object and return its handle
    pub fn alloc(&mut self, object: Object) -> ObjId {
        self.objects.push(object);
        ObjId(self.objects.len() - 1)
    }

    /// Borrow an object
    #[inline]
    #[must_use]
    pub fn get(&self, id: ObjId) -> Option<&Object> {
        self.objects.get(id.index())
    }

    /// Mutably borrow an object
    #[inline]
    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Object> {
        self.objects.get_mut(id.index())
    }

    /// Borrow the items of a dict object
    #[must_use]
    pub fn dict(&self, id: ObjId) -> Option<&[(Value, Value)]> {
        match self.get(id) {
            Some(Object::Dict(items)) => Some(items),
            _ => None,
        }
    }

    /// Mutably borrow the items of a dict object
    pub fn dict_mut(&mut self, id: ObjId) -> Option<&mut Vec<(Value, Value)>> {
        match self.get_mut(id) {
            Some(Object::Dict(items)) => Some(items),
            _ => None,
        }
    }

    /// Borrow an instance object
    #[must_use]
    pub fn instance(&self, id: ObjId) -> Option<&Instance> {
        match self.get(id) {
            Some(Object::Instance(instance)) => Some(instance),
            _ => None,
        }
    }

    /// Iterate over every object mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.objects.iter_mut()
    }

    /// Number of objects
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the heap holds no objects
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Look up a key in dict items by text
///
/// Keys may be text or protocol 2 strings.
#[must_use]
pub fn dict_get<'a>(items: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    items.iter().find(|(k, _)| k.is_text(key)).map(|(_, v)| v)
}

/// Mutable variant of [`dict_get`]
pub fn dict_get_mut<'a>(items: &'a mut [(Value, Value)], key: &str) -> Option<&'a mut Value> {
    items
        .iter_mut()
        .find(|(k, _)| k.is_text(key))
        .map(|(_, v)| v)
}

/// Minimal little-endian two's complement encoding, as written by `LONG1`
pub(crate) fn long_bytes(value: i128) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut bytes = value.to_le_bytes().to_vec();
    while bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        let sign = bytes[bytes.len() - 2] & 0x80;
        if (last == 0x00 && sign == 0) || (last == 0xff && sign != 0) {
            bytes.pop();
        } else {
            break;
        }
    }
    bytes
}

/// Integer value from `LONG1`/`LONG4` operand bytes
pub(crate) fn long_value(bytes: &[u8]) -> Value {
    if bytes.len() > 8 {
        return Value::Long(bytes.to_vec());
    }
    let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
    let mut buf = if negative { [0xff; 8] } else { [0; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Value::Int(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_display() {
        let global = Global::new("module1", "Factory");
        assert_eq!(global.to_string(), "module1.Factory");
        assert!(global.is("module1", "Factory"));
        assert!(!global.is_broken());
    }

    #[test]
    fn broken_global_differs_from_resolved() {
        let broken = Global::broken("module1", "Factory");
        assert!(broken.is_broken());
        assert_ne!(broken, Global::new("module1", "Factory"));
    }

    #[test]
    fn text_matching_accepts_legacy_strings() {
        assert!(Value::str("name").is_text("name"));
        assert!(Value::LegacyString(b"name".to_vec()).is_text("name"));
        assert!(!Value::Bytes(b"name".to_vec()).is_text("name"));
    }

    #[test]
    fn long_encoding_is_minimal() {
        assert_eq!(long_bytes(0), Vec::<u8>::new());
        assert_eq!(long_bytes(255), vec![0xff, 0x00]);
        assert_eq!(long_bytes(-1), vec![0xff]);
        assert_eq!(long_bytes(-256), vec![0x00, 0xff]);
        assert_eq!(long_value(&long_bytes(1 << 40)), Value::Int(1 << 40));
        assert_eq!(long_value(&[0xff]), Value::Int(-1));
        assert!(matches!(long_value(&long_bytes(1 << 70)), Value::Long(_)));
    }

    #[test]
    fn heap_alloc_and_lookup() {
        let mut heap = Heap::new();
        let id = heap.alloc(Object::Dict(vec![(Value::str("a"), Value::Int(1))]));
        assert_eq!(heap.len(), 1);
        assert_eq!(dict_get(heap.dict(id).unwrap(), "a"), Some(&Value::Int(1)));

        *dict_get_mut(heap.dict_mut(id).unwrap(), "a").unwrap() = Value::Int(2);
        assert_eq!(dict_get(heap.dict(id).unwrap(), "a"), Some(&Value::Int(2)));
    }
}
