//! Pickle writer
//!
//! [`Pickler`] writes values back with the same opcode choices as the
//! reference Python pickler for protocols 2 to 4: binary integers sized to
//! the value, memo slots assigned in emission order, dict and list items
//! batched by 1000, globals memoized so a class written twice is written
//! once and recalled afterwards. Frames are never emitted.
//!
//! Consecutive [`Pickler::dump`] calls share one memo, mirroring
//! [`crate::Unpickler::load`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::{EmitError, EmitResult};
use crate::opcode::Opcode;
use crate::value::{long_bytes, Construct, Global, Heap, ObjId, Object, Value};

const BATCH_SIZE: usize = 1000;

/// Target protocol for writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Protocol(u8);

impl Protocol {
    /// Protocol 2, readable by Python 2
    pub const V2: Self = Self(2);
    /// Protocol 3, first with a `bytes` type
    pub const V3: Self = Self(3);
    /// Protocol 4
    pub const V4: Self = Self(4);

    /// Create protocol, rejecting versions the writer cannot produce
    ///
    /// # Errors
    /// Returns error for protocols outside `2..=4`.
    pub fn new(version: u8) -> EmitResult<Self> {
        if (2..=4).contains(&version) {
            Ok(Self(version))
        } else {
            Err(EmitError::UnsupportedProtocol(version))
        }
    }

    /// Protocol number
    #[inline]
    #[must_use]
    pub fn version(self) -> u8 {
        self.0
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::V3
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encoder writing values from one heap
#[derive(Debug)]
pub struct Pickler<'h> {
    protocol: Protocol,
    heap: &'h Heap,
    out: Vec<u8>,
    next_slot: u32,
    globals: HashMap<(String, String), u32>,
    objects: HashMap<ObjId, u32>,
    constructing: HashSet<ObjId>,
}

impl<'h> Pickler<'h> {
    /// Create writer
    #[must_use]
    pub fn new(protocol: Protocol, heap: &'h Heap) -> Self {
        Self {
            protocol,
            heap,
            out: Vec::new(),
            next_slot: 0,
            globals: HashMap::new(),
            objects: HashMap::new(),
            constructing: HashSet::new(),
        }
    }

    /// Write one complete pickle: `PROTO`, the value, `STOP`
    ///
    /// # Errors
    /// Returns error if the value cannot be expressed at this protocol.
    pub fn dump(&mut self, value: &Value) -> EmitResult<()> {
        self.op(Opcode::Proto);
        self.out.push(self.protocol.version());
        self.save(value)?;
        self.op(Opcode::Stop);
        Ok(())
    }

    /// Bytes written so far
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    fn version(&self) -> u8 {
        self.protocol.version()
    }

    fn op(&mut self, op: Opcode) {
        self.out.push(op.byte());
    }

    fn len_u32(&mut self, len: usize, what: &'static str) -> EmitResult<()> {
        let len = u32::try_from(len).map_err(|_| EmitError::UnsupportedAtProtocol {
            what,
            protocol: self.version(),
        })?;
        self.out.extend_from_slice(&len.to_le_bytes());
        Ok(())
    }

    fn memoize(&mut self) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        if self.version() >= 4 {
            self.op(Opcode::Memoize);
        } else if let Ok(short) = u8::try_from(slot) {
            self.op(Opcode::BinPut);
            self.out.push(short);
        } else {
            self.op(Opcode::LongBinPut);
            self.out.extend_from_slice(&slot.to_le_bytes());
        }
        slot
    }

    fn recall(&mut self, slot: u32) {
        if let Ok(short) = u8::try_from(slot) {
            self.op(Opcode::BinGet);
            self.out.push(short);
        } else {
            self.op(Opcode::LongBinGet);
            self.out.extend_from_slice(&slot.to_le_bytes());
        }
    }

    fn save(&mut self, value: &Value) -> EmitResult<()> {
        match value {
            Value::None => self.op(Opcode::None),
            Value::Bool(true) => self.op(Opcode::NewTrue),
            Value::Bool(false) => self.op(Opcode::NewFalse),
            Value::Int(int) => self.save_int(*int),
            Value::Long(bytes) => self.save_long(bytes)?,
            Value::Float(float) => {
                self.op(Opcode::BinFloat);
                self.out.extend_from_slice(&float.to_be_bytes());
            }
            Value::Str(text) => self.save_str(text)?,
            Value::Bytes(bytes) => self.save_bytes(bytes)?,
            Value::LegacyString(bytes) => {
                if let Ok(len) = u8::try_from(bytes.len()) {
                    self.op(Opcode::ShortBinString);
                    self.out.push(len);
                } else {
                    self.op(Opcode::BinString);
                    let len = i32::try_from(bytes.len()).map_err(|_| {
                        EmitError::UnsupportedAtProtocol {
                            what: "legacy string over 2 GiB",
                            protocol: self.version(),
                        }
                    })?;
                    self.out.extend_from_slice(&len.to_le_bytes());
                }
                self.out.extend_from_slice(bytes);
                self.memoize();
            }
            Value::ByteArray(bytes) => self.save_bytearray(bytes)?,
            Value::Tuple(items) => self.save_tuple(items)?,
            Value::Global(global) => self.save_global(global)?,
            Value::Ref(id) => self.save_object(*id)?,
            Value::Persistent(pid) => {
                self.save(pid)?;
                self.op(Opcode::BinPersId);
            }
        }
        Ok(())
    }

    fn save_int(&mut self, int: i64) {
        if let Ok(small) = u8::try_from(int) {
            self.op(Opcode::BinInt1);
            self.out.push(small);
        } else if let Ok(medium) = u16::try_from(int) {
            self.op(Opcode::BinInt2);
            self.out.extend_from_slice(&medium.to_le_bytes());
        } else if let Ok(word) = i32::try_from(int) {
            self.op(Opcode::BinInt);
            self.out.extend_from_slice(&word.to_le_bytes());
        } else {
            let bytes = long_bytes(i128::from(int));
            self.op(Opcode::Long1);
            self.out.push(bytes.len() as u8);
            self.out.extend_from_slice(&bytes);
        }
    }

    fn save_long(&mut self, bytes: &[u8]) -> EmitResult<()> {
        if let Ok(len) = u8::try_from(bytes.len()) {
            self.op(Opcode::Long1);
            self.out.push(len);
        } else {
            self.op(Opcode::Long4);
            let len = i32::try_from(bytes.len()).map_err(|_| EmitError::UnsupportedAtProtocol {
                what: "integer wider than 2 GiB",
                protocol: self.version(),
            })?;
            self.out.extend_from_slice(&len.to_le_bytes());
        }
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn save_str(&mut self, text: &str) -> EmitResult<()> {
        let bytes = text.as_bytes();
        match u8::try_from(bytes.len()) {
            Ok(len) if self.version() >= 4 => {
                self.op(Opcode::ShortBinUnicode);
                self.out.push(len);
            }
            _ if self.version() >= 4 && u32::try_from(bytes.len()).is_err() => {
                self.op(Opcode::BinUnicode8);
                self.out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            }
            _ => {
                self.op(Opcode::BinUnicode);
                self.len_u32(bytes.len(), "string over 4 GiB")?;
            }
        }
        self.out.extend_from_slice(bytes);
        self.memoize();
        Ok(())
    }

    fn save_bytes(&mut self, bytes: &[u8]) -> EmitResult<()> {
        if self.version() < 3 {
            // Protocol 2 has no bytes type: rebuild through codecs.encode.
            if bytes.is_empty() {
                self.save_global(&Global::new("__builtin__", "bytes"))?;
                self.op(Opcode::EmptyTuple);
            } else {
                self.save_global(&Global::new("_codecs", "encode"))?;
                let latin1: String = bytes.iter().map(|b| char::from(*b)).collect();
                self.save_str(&latin1)?;
                self.save_str("latin1")?;
                self.op(Opcode::Tuple2);
                self.memoize();
            }
            self.op(Opcode::Reduce);
            self.memoize();
            return Ok(());
        }

        if let Ok(len) = u8::try_from(bytes.len()) {
            self.op(Opcode::ShortBinBytes);
            self.out.push(len);
        } else if u32::try_from(bytes.len()).is_err() && self.version() >= 4 {
            self.op(Opcode::BinBytes8);
            self.out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        } else {
            self.op(Opcode::BinBytes);
            self.len_u32(bytes.len(), "bytes over 4 GiB")?;
        }
        self.out.extend_from_slice(bytes);
        self.memoize();
        Ok(())
    }

    fn save_bytearray(&mut self, bytes: &[u8]) -> EmitResult<()> {
        if self.version() < 3 {
            self.save_global(&Global::new("__builtin__", "bytearray"))?;
            let latin1: String = bytes.iter().map(|b| char::from(*b)).collect();
            self.save_str(&latin1)?;
            self.save_str("latin-1")?;
            self.op(Opcode::Tuple2);
        } else {
            self.save_global(&Global::new("builtins", "bytearray"))?;
            self.save_bytes(bytes)?;
            self.op(Opcode::Tuple1);
        }
        self.memoize();
        self.op(Opcode::Reduce);
        self.memoize();
        Ok(())
    }

    fn save_tuple(&mut self, items: &[Value]) -> EmitResult<()> {
        if items.is_empty() {
            self.op(Opcode::EmptyTuple);
            return Ok(());
        }
        if items.len() <= 3 {
            for item in items {
                self.save(item)?;
            }
            self.op(match items.len() {
                1 => Opcode::Tuple1,
                2 => Opcode::Tuple2,
                _ => Opcode::Tuple3,
            });
        } else {
            self.op(Opcode::Mark);
            for item in items {
                self.save(item)?;
            }
            self.op(Opcode::Tuple);
        }
        self.memoize();
        Ok(())
    }

    fn save_global(&mut self, global: &Global) -> EmitResult<()> {
        let key = (global.module().to_string(), global.name().to_string());
        if let Some(slot) = self.globals.get(&key) {
            self.recall(*slot);
            return Ok(());
        }

        let reject = |reason| EmitError::IrreproducibleGlobal {
            module: global.module().to_string(),
            name: global.name().to_string(),
            reason,
        };
        if global.module().is_empty() || global.name().is_empty() {
            return Err(reject("empty module or name"));
        }

        if self.version() >= 4 {
            self.save_str(global.module())?;
            self.save_str(global.name())?;
            self.op(Opcode::StackGlobal);
        } else {
            if global.module().contains('\n') || global.name().contains('\n') {
                return Err(reject("newline in module or name"));
            }
            self.op(Opcode::Global);
            self.out.extend_from_slice(global.module().as_bytes());
            self.out.push(b'\n');
            self.out.extend_from_slice(global.name().as_bytes());
            self.out.push(b'\n');
        }
        let slot = self.memoize();
        self.globals.insert(key, slot);
        Ok(())
    }

    fn save_object(&mut self, id: ObjId) -> EmitResult<()> {
        if let Some(slot) = self.objects.get(&id) {
            self.recall(*slot);
            return Ok(());
        }
        if self.constructing.contains(&id) {
            return Err(EmitError::RecursiveConstruct(id.index()));
        }
        let heap = self.heap;
        let object = heap.get(id).ok_or(EmitError::DanglingRef(id.index()))?;

        match object {
            Object::List(items) => {
                self.op(Opcode::EmptyList);
                self.remember(id);
                self.save_appends(items)?;
            }
            Object::Dict(items) => {
                self.op(Opcode::EmptyDict);
                self.remember(id);
                self.save_setitems(items)?;
            }
            Object::Set(items) => {
                if self.version() >= 4 {
                    self.op(Opcode::EmptySet);
                    self.remember(id);
                    for batch in items.chunks(BATCH_SIZE) {
                        self.op(Opcode::Mark);
                        for item in batch {
                            self.save(item)?;
                        }
                        self.op(Opcode::AddItems);
                    }
                } else {
                    self.save_set_reduce("set", items)?;
                    self.remember(id);
                }
            }
            Object::FrozenSet(items) => {
                if self.version() >= 4 {
                    self.op(Opcode::Mark);
                    for item in items {
                        self.save(item)?;
                    }
                    self.op(Opcode::FrozenSet);
                } else {
                    self.save_set_reduce("frozenset", items)?;
                }
                self.remember(id);
            }
            Object::Instance(instance) => {
                self.constructing.insert(id);
                self.save_construct(&instance.construct)?;
                self.constructing.remove(&id);
                self.remember(id);
                self.save_appends(&instance.list_items)?;
                self.save_setitems(&instance.dict_items)?;
                for state in &instance.state {
                    self.save(state)?;
                    self.op(Opcode::Build);
                }
            }
        }
        Ok(())
    }

    fn remember(&mut self, id: ObjId) {
        let slot = self.memoize();
        self.objects.insert(id, slot);
    }

    fn save_construct(&mut self, construct: &Construct) -> EmitResult<()> {
        match construct {
            Construct::Reduce { callable, args } => {
                self.save(callable)?;
                self.save(args)?;
                self.op(Opcode::Reduce);
            }
            Construct::NewObj { class, args } => {
                self.save(class)?;
                self.save(args)?;
                self.op(Opcode::NewObj);
            }
            Construct::NewObjEx {
                class,
                args,
                kwargs,
            } => {
                if self.version() < 4 {
                    return Err(EmitError::UnsupportedAtProtocol {
                        what: "keyword-only construction",
                        protocol: self.version(),
                    });
                }
                self.save(class)?;
                self.save(args)?;
                self.save(kwargs)?;
                self.op(Opcode::NewObjEx);
            }
            Construct::Inst { class, args } => {
                self.op(Opcode::Mark);
                self.save(class)?;
                for arg in args {
                    self.save(arg)?;
                }
                self.op(Opcode::Obj);
            }
        }
        Ok(())
    }

    fn save_appends(&mut self, items: &[Value]) -> EmitResult<()> {
        for batch in items.chunks(BATCH_SIZE) {
            if let [item] = batch {
                self.save(item)?;
                self.op(Opcode::Append);
            } else {
                self.op(Opcode::Mark);
                for item in batch {
                    self.save(item)?;
                }
                self.op(Opcode::Appends);
            }
        }
        Ok(())
    }

    fn save_setitems(&mut self, items: &[(Value, Value)]) -> EmitResult<()> {
        for batch in items.chunks(BATCH_SIZE) {
            if let [(key, value)] = batch {
                self.save(key)?;
                self.save(value)?;
                self.op(Opcode::SetItem);
            } else {
                self.op(Opcode::Mark);
                for (key, value) in batch {
                    self.save(key)?;
                    self.save(value)?;
                }
                self.op(Opcode::SetItems);
            }
        }
        Ok(())
    }

    /// Sets before protocol 4 are written as `set([items])`
    fn save_set_reduce(&mut self, name: &str, items: &[Value]) -> EmitResult<()> {
        let module = if self.version() < 3 { "__builtin__" } else { "builtins" };
        self.save_global(&Global::new(module, name))?;
        self.op(Opcode::EmptyList);
        self.memoize();
        self.save_appends(items)?;
        self.op(Opcode::Tuple1);
        self.memoize();
        self.op(Opcode::Reduce);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dump_all, load_all};
    use pretty_assertions::assert_eq;

    fn dump(values: &[Value], heap: &Heap, protocol: Protocol) -> Vec<u8> {
        dump_all(values, heap, protocol).unwrap()
    }

    #[test]
    fn protocol_range() {
        assert!(Protocol::new(1).is_err());
        assert_eq!(Protocol::new(3).unwrap(), Protocol::default());
        assert!(Protocol::new(5).is_err());
    }

    #[test]
    fn class_and_empty_state() {
        let mut heap = Heap::new();
        let state = Value::Ref(heap.alloc(Object::Dict(Vec::new())));
        let class = Value::Global(Global::new("module1", "NewFactory"));
        assert_eq!(
            dump(&[class, state], &heap, Protocol::V3),
            b"\x80\x03cmodule1\nNewFactory\nq\x00.\x80\x03}q\x01.".to_vec()
        );
    }

    #[test]
    fn repeated_global_is_recalled() {
        let heap = Heap::new();
        let global = Value::Global(Global::new("module1", "Factory"));
        let pair = Value::Tuple(vec![global.clone(), global.clone()]);
        assert_eq!(
            dump(&[global, pair], &heap, Protocol::V3),
            b"\x80\x03cmodule1\nFactory\nq\x00.\x80\x03h\x00h\x00\x86q\x01.".to_vec()
        );
    }

    #[test]
    fn integer_widths() {
        let heap = Heap::new();
        let ints = Value::Tuple(vec![
            Value::Int(1),
            Value::Int(300),
            Value::Int(-1),
            Value::Int(1 << 40),
        ]);
        assert_eq!(
            dump(&[ints], &heap, Protocol::V3),
            b"\x80\x03(K\x01M\x2c\x01J\xff\xff\xff\xff\x8a\x06\x00\x00\x00\x00\x00\x01tq\x00.".to_vec()
        );
    }

    #[test]
    fn persistent_reference_with_class() {
        let heap = Heap::new();
        let pid = Value::Tuple(vec![
            Value::Bytes(vec![0, 0, 0, 0, 0, 0, 0, 2]),
            Value::Global(Global::new("module2", "OtherFactory")),
        ]);
        let value = Value::Persistent(Box::new(pid));
        assert_eq!(
            dump(&[value], &heap, Protocol::V3),
            b"\x80\x03C\x08\x00\x00\x00\x00\x00\x00\x00\x02q\x00cmodule2\nOtherFactory\nq\x01\x86q\x02Q.".to_vec()
        );
    }

    #[test]
    fn protocol_four_uses_stack_global_and_memoize() {
        let heap = Heap::new();
        let class = Value::Global(Global::new("module1", "Factory"));
        assert_eq!(
            dump(&[class], &heap, Protocol::V4),
            b"\x80\x04\x8c\x07module1\x94\x8c\x07Factory\x94\x93\x94.".to_vec()
        );
    }

    #[test]
    fn bytes_at_protocol_two() {
        let heap = Heap::new();
        assert_eq!(
            dump(&[Value::Bytes(vec![0x41])], &heap, Protocol::V2),
            b"\x80\x02c_codecs\nencode\nq\x00X\x01\x00\x00\x00Aq\x01X\x06\x00\x00\x00latin1q\x02\x86q\x03Rq\x04.".to_vec()
        );
    }

    #[test]
    fn newline_in_global_is_rejected() {
        let heap = Heap::new();
        let class = Value::Global(Global::broken("bad\nmodule", "Factory"));
        let err = dump_all(&[class], &heap, Protocol::V3).unwrap_err();
        assert!(matches!(err, EmitError::IrreproducibleGlobal { .. }));
    }

    #[test]
    fn self_referencing_state_is_written() {
        let mut heap = Heap::new();
        let list = heap.alloc(Object::List(Vec::new()));
        if let Some(Object::List(items)) = heap.get_mut(list) {
            items.push(Value::Ref(list));
        }
        let bytes = dump(&[Value::Ref(list)], &heap, Protocol::V3);
        assert_eq!(bytes, b"\x80\x03]q\x00h\x00a.".to_vec());
    }

    #[test]
    fn recursive_constructor_is_rejected() {
        let mut heap = Heap::new();
        let list = heap.alloc(Object::List(Vec::new()));
        let instance = heap.alloc(Object::Instance(crate::Instance::new(Construct::Reduce {
            callable: Value::Global(Global::new("module1", "make")),
            args: Value::Tuple(vec![Value::Ref(list)]),
        })));
        if let Some(Object::List(items)) = heap.get_mut(list) {
            items.push(Value::Ref(instance));
        }

        let err = dump_all(&[Value::Ref(instance)], &heap, Protocol::V3).unwrap_err();
        assert!(matches!(err, EmitError::RecursiveConstruct(_)));
    }

    #[test]
    fn rewritten_graph_reads_back() {
        let data = b"\x80\x03cmodule1\nFactory\nq\x00.\x80\x03}q\x01(X\x04\x00\x00\x00dataq\x02cmodule1\nData\nq\x03)\x81q\x04}q\x05bX\x04\x00\x00\x00selfq\x06h\x00u.";
        let (values, heap) = load_all(data).unwrap();
        let bytes = dump(&values, &heap, Protocol::V3);
        assert_eq!(bytes, data.to_vec());
    }
}
