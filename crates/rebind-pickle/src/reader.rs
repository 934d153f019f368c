//! Pickle reader
//!
//! [`Unpickler`] decodes consecutive pickles from one buffer. The memo is
//! kept between calls to [`Unpickler::load`], so a second pickle may refer
//! to objects memoized by the first one. Class lookups and persistent ids
//! are delegated to [`LoadHooks`].

use std::collections::HashMap;

use crate::error::{DecodeError, DecodeResult, HookError};
use crate::opcode::Opcode;
use crate::value::{long_bytes, long_value, Construct, Global, Heap, Instance, ObjId, Object, Value};

/// Callbacks invoked while decoding
pub trait LoadHooks {
    /// Resolve a `GLOBAL`/`STACK_GLOBAL`/`INST` reference
    ///
    /// # Errors
    /// Returns error to abort decoding.
    fn find_class(&mut self, module: &str, name: &str) -> Result<Value, HookError>;

    /// Replace a persistent id with the value to put on the stack
    ///
    /// # Errors
    /// Returns error to abort decoding.
    fn persistent_load(&mut self, pid: Value, heap: &mut Heap) -> Result<Value, HookError>;
}

impl<T: LoadHooks + ?Sized> LoadHooks for &mut T {
    fn find_class(&mut self, module: &str, name: &str) -> Result<Value, HookError> {
        (**self).find_class(module, name)
    }

    fn persistent_load(&mut self, pid: Value, heap: &mut Heap) -> Result<Value, HookError> {
        (**self).persistent_load(pid, heap)
    }
}

/// Hooks that keep globals and persistent ids exactly as read
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainHooks;

impl LoadHooks for PlainHooks {
    fn find_class(&mut self, module: &str, name: &str) -> Result<Value, HookError> {
        Ok(Value::Global(Global::new(module, name)))
    }

    fn persistent_load(&mut self, pid: Value, _heap: &mut Heap) -> Result<Value, HookError> {
        Ok(Value::Persistent(Box::new(pid)))
    }
}

/// Streaming decoder over a byte buffer
#[derive(Debug)]
pub struct Unpickler<'a, H> {
    input: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u64, Value>,
    heap: Heap,
    hooks: H,
    protocol: u8,
}

impl<'a, H: LoadHooks> Unpickler<'a, H> {
    /// Create decoder over `input`
    #[must_use]
    pub fn new(input: &'a [u8], hooks: H) -> Self {
        Self {
            input,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            heap: Heap::new(),
            hooks,
            protocol: 0,
        }
    }

    /// Current read offset
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether the whole input has been consumed
    #[inline]
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// Protocol announced by the last `PROTO` opcode
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Objects decoded so far
    #[inline]
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Hooks passed at construction
    #[inline]
    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Give up the decoder and keep the decoded objects
    #[must_use]
    pub fn into_heap(self) -> Heap {
        self.heap
    }

    /// Decode the next pickle, up to and including its `STOP`
    ///
    /// # Errors
    /// Returns error on malformed input or when a hook fails.
    pub fn load(&mut self) -> DecodeResult<Value> {
        self.stack.clear();
        self.marks.clear();
        loop {
            let offset = self.pos;
            let byte = self.read_u8()?;
            let op = Opcode::from_byte(byte)
                .ok_or(DecodeError::UnknownOpcode { opcode: byte, offset })?;
            if op == Opcode::Stop {
                return self.pop(offset);
            }
            self.dispatch(op, offset)?;
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, op: Opcode, offset: usize) -> DecodeResult<()> {
        match op {
            Opcode::Proto => {
                let protocol = self.read_u8()?;
                if protocol > 5 {
                    return Err(DecodeError::UnsupportedProtocol(protocol));
                }
                self.protocol = protocol;
            }
            Opcode::Frame => {
                self.read_u64()?;
            }
            Opcode::Stop => unreachable!("STOP is handled by load"),

            Opcode::Mark => self.marks.push(self.stack.len()),
            Opcode::Pop => {
                if self.marks.last() == Some(&self.stack.len()) {
                    self.marks.pop();
                } else {
                    self.pop(offset)?;
                }
            }
            Opcode::PopMark => {
                self.pop_mark(offset)?;
            }
            Opcode::Dup => {
                let top = self.top(offset)?.clone();
                self.stack.push(top);
            }

            Opcode::None => self.stack.push(Value::None),
            Opcode::NewTrue => self.stack.push(Value::Bool(true)),
            Opcode::NewFalse => self.stack.push(Value::Bool(false)),
            Opcode::Int => {
                let line = self.read_text_line(offset)?;
                let value = match line {
                    "00" => Value::Bool(false),
                    "01" => Value::Bool(true),
                    _ => parse_decimal(line).ok_or_else(|| DecodeError::malformed("INT", offset))?,
                };
                self.stack.push(value);
            }
            Opcode::Long => {
                let line = self.read_text_line(offset)?;
                let digits = line.strip_suffix('L').unwrap_or(line);
                let value =
                    parse_decimal(digits).ok_or_else(|| DecodeError::malformed("LONG", offset))?;
                self.stack.push(value);
            }
            Opcode::BinInt => {
                let value = i32::from_le_bytes(self.read_array()?);
                self.stack.push(Value::Int(i64::from(value)));
            }
            Opcode::BinInt1 => {
                let value = self.read_u8()?;
                self.stack.push(Value::Int(i64::from(value)));
            }
            Opcode::BinInt2 => {
                let value = u16::from_le_bytes(self.read_array()?);
                self.stack.push(Value::Int(i64::from(value)));
            }
            Opcode::Long1 => {
                let len = usize::from(self.read_u8()?);
                let bytes = self.read_exact(len)?;
                self.stack.push(long_value(bytes));
            }
            Opcode::Long4 => {
                let len = i32::from_le_bytes(self.read_array()?);
                let len = usize::try_from(len).map_err(|_| DecodeError::malformed("LONG4 length", offset))?;
                let bytes = self.read_exact(len)?;
                self.stack.push(long_value(bytes));
            }
            Opcode::Float => {
                let line = self.read_text_line(offset)?;
                let value: f64 = line
                    .parse()
                    .map_err(|_| DecodeError::malformed("FLOAT", offset))?;
                self.stack.push(Value::Float(value));
            }
            Opcode::BinFloat => {
                let value = f64::from_be_bytes(self.read_array()?);
                self.stack.push(Value::Float(value));
            }

            Opcode::String => {
                let line = self.read_line()?;
                let bytes =
                    unquote_legacy(line).ok_or_else(|| DecodeError::malformed("STRING", offset))?;
                self.stack.push(Value::LegacyString(bytes));
            }
            Opcode::BinString => {
                let len = i32::from_le_bytes(self.read_array()?);
                let len = usize::try_from(len)
                    .map_err(|_| DecodeError::malformed("BINSTRING length", offset))?;
                let bytes = self.read_exact(len)?.to_vec();
                self.stack.push(Value::LegacyString(bytes));
            }
            Opcode::ShortBinString => {
                let len = usize::from(self.read_u8()?);
                let bytes = self.read_exact(len)?.to_vec();
                self.stack.push(Value::LegacyString(bytes));
            }
            Opcode::Unicode => {
                let line = self.read_line()?;
                let text = raw_unicode_unescape(line)
                    .ok_or_else(|| DecodeError::malformed("UNICODE", offset))?;
                self.stack.push(Value::Str(text));
            }
            Opcode::BinUnicode => {
                let len = self.read_u32_len()?;
                self.push_utf8(len, offset)?;
            }
            Opcode::ShortBinUnicode => {
                let len = usize::from(self.read_u8()?);
                self.push_utf8(len, offset)?;
            }
            Opcode::BinUnicode8 => {
                let len = self.read_u64_len(offset)?;
                self.push_utf8(len, offset)?;
            }
            Opcode::BinBytes => {
                let len = self.read_u32_len()?;
                let bytes = self.read_exact(len)?.to_vec();
                self.stack.push(Value::Bytes(bytes));
            }
            Opcode::ShortBinBytes => {
                let len = usize::from(self.read_u8()?);
                let bytes = self.read_exact(len)?.to_vec();
                self.stack.push(Value::Bytes(bytes));
            }
            Opcode::BinBytes8 => {
                let len = self.read_u64_len(offset)?;
                let bytes = self.read_exact(len)?.to_vec();
                self.stack.push(Value::Bytes(bytes));
            }
            Opcode::ByteArray8 => {
                let len = self.read_u64_len(offset)?;
                let bytes = self.read_exact(len)?.to_vec();
                self.stack.push(Value::ByteArray(bytes));
            }

            Opcode::EmptyTuple => self.stack.push(Value::Tuple(Vec::new())),
            Opcode::Tuple => {
                let items = self.pop_mark(offset)?;
                self.stack.push(Value::Tuple(items));
            }
            Opcode::Tuple1 | Opcode::Tuple2 | Opcode::Tuple3 => {
                let n = match op {
                    Opcode::Tuple1 => 1,
                    Opcode::Tuple2 => 2,
                    _ => 3,
                };
                if self.stack.len() < n {
                    return Err(DecodeError::StackUnderflow { offset });
                }
                let items = self.stack.split_off(self.stack.len() - n);
                self.stack.push(Value::Tuple(items));
            }
            Opcode::EmptyList => self.push_object(Object::List(Vec::new())),
            Opcode::List => {
                let items = self.pop_mark(offset)?;
                self.push_object(Object::List(items));
            }
            Opcode::EmptyDict => self.push_object(Object::Dict(Vec::new())),
            Opcode::Dict => {
                let items = self.pop_mark(offset)?;
                let pairs = into_pairs(items).ok_or_else(|| DecodeError::malformed("DICT", offset))?;
                self.push_object(Object::Dict(pairs));
            }
            Opcode::EmptySet => self.push_object(Object::Set(Vec::new())),
            Opcode::FrozenSet => {
                let items = self.pop_mark(offset)?;
                self.push_object(Object::FrozenSet(items));
            }

            Opcode::Append => {
                let value = self.pop(offset)?;
                self.extend_list(vec![value], offset)?;
            }
            Opcode::Appends => {
                let items = self.pop_mark(offset)?;
                self.extend_list(items, offset)?;
            }
            Opcode::SetItem => {
                let value = self.pop(offset)?;
                let key = self.pop(offset)?;
                self.extend_dict(vec![(key, value)], offset)?;
            }
            Opcode::SetItems => {
                let items = self.pop_mark(offset)?;
                let pairs =
                    into_pairs(items).ok_or_else(|| DecodeError::malformed("SETITEMS", offset))?;
                self.extend_dict(pairs, offset)?;
            }
            Opcode::AddItems => {
                let items = self.pop_mark(offset)?;
                let target = self.top_object(offset)?;
                match self.heap.get_mut(target) {
                    Some(Object::Set(set)) => set.extend(items),
                    _ => return Err(DecodeError::malformed("ADDITEMS target", offset)),
                }
            }
            Opcode::Build => {
                let state = self.pop(offset)?;
                let target = self.top_object(offset)?;
                match self.heap.get_mut(target) {
                    Some(Object::Instance(instance)) => instance.state.push(state),
                    _ => return Err(DecodeError::malformed("BUILD target", offset)),
                }
            }

            Opcode::Global => {
                let module = self.read_text_line(offset)?;
                let name = self.read_text_line(offset)?;
                let class = self.hooks.find_class(module, name).map_err(DecodeError::Hook)?;
                self.stack.push(class);
            }
            Opcode::StackGlobal => {
                let name = self.pop(offset)?;
                let module = self.pop(offset)?;
                let (Value::Str(module), Value::Str(name)) = (module, name) else {
                    return Err(DecodeError::malformed("STACK_GLOBAL operands", offset));
                };
                let class = self
                    .hooks
                    .find_class(&module, &name)
                    .map_err(DecodeError::Hook)?;
                self.stack.push(class);
            }
            Opcode::Reduce => {
                let args = self.pop(offset)?;
                let callable = self.pop(offset)?;
                self.push_instance(Construct::Reduce { callable, args });
            }
            Opcode::NewObj => {
                let args = self.pop(offset)?;
                let class = self.pop(offset)?;
                self.push_instance(Construct::NewObj { class, args });
            }
            Opcode::NewObjEx => {
                let kwargs = self.pop(offset)?;
                let args = self.pop(offset)?;
                let class = self.pop(offset)?;
                self.push_instance(Construct::NewObjEx {
                    class,
                    args,
                    kwargs,
                });
            }
            Opcode::Inst => {
                let module = self.read_text_line(offset)?;
                let name = self.read_text_line(offset)?;
                let class = self.hooks.find_class(module, name).map_err(DecodeError::Hook)?;
                let args = self.pop_mark(offset)?;
                self.push_instance(Construct::Inst { class, args });
            }
            Opcode::Obj => {
                let mut items = self.pop_mark(offset)?;
                if items.is_empty() {
                    return Err(DecodeError::malformed("OBJ", offset));
                }
                let class = items.remove(0);
                self.push_instance(Construct::Inst { class, args: items });
            }

            Opcode::PersId => {
                let pid = self.read_text_line(offset)?.to_string();
                let value = self
                    .hooks
                    .persistent_load(Value::Str(pid), &mut self.heap)
                    .map_err(DecodeError::Hook)?;
                self.stack.push(value);
            }
            Opcode::BinPersId => {
                let pid = self.pop(offset)?;
                let value = self
                    .hooks
                    .persistent_load(pid, &mut self.heap)
                    .map_err(DecodeError::Hook)?;
                self.stack.push(value);
            }

            Opcode::Put => {
                let key = self
                    .read_text_line(offset)?
                    .parse()
                    .map_err(|_| DecodeError::malformed("PUT index", offset))?;
                self.memoize(key, offset)?;
            }
            Opcode::BinPut => {
                let key = u64::from(self.read_u8()?);
                self.memoize(key, offset)?;
            }
            Opcode::LongBinPut => {
                let key = u64::from(u32::from_le_bytes(self.read_array()?));
                self.memoize(key, offset)?;
            }
            Opcode::Memoize => {
                let key = self.memo.len() as u64;
                self.memoize(key, offset)?;
            }
            Opcode::Get => {
                let key = self
                    .read_text_line(offset)?
                    .parse()
                    .map_err(|_| DecodeError::malformed("GET index", offset))?;
                self.recall(key, offset)?;
            }
            Opcode::BinGet => {
                let key = u64::from(self.read_u8()?);
                self.recall(key, offset)?;
            }
            Opcode::LongBinGet => {
                let key = u64::from(u32::from_le_bytes(self.read_array()?));
                self.recall(key, offset)?;
            }

            Opcode::Ext1 | Opcode::Ext2 | Opcode::Ext4 => {
                return Err(DecodeError::UnsupportedOpcode {
                    name: "EXT",
                    offset,
                })
            }
            Opcode::NextBuffer | Opcode::ReadonlyBuffer => {
                return Err(DecodeError::UnsupportedOpcode {
                    name: "out-of-band buffer",
                    offset,
                })
            }
        }
        Ok(())
    }

    fn push_object(&mut self, object: Object) {
        let id = self.heap.alloc(object);
        self.stack.push(Value::Ref(id));
    }

    fn push_instance(&mut self, construct: Construct) {
        self.push_object(Object::Instance(Instance::new(construct)));
    }

    fn extend_list(&mut self, items: Vec<Value>, offset: usize) -> DecodeResult<()> {
        let target = self.top_object(offset)?;
        match self.heap.get_mut(target) {
            Some(Object::List(list)) => list.extend(items),
            Some(Object::Instance(instance)) => instance.list_items.extend(items),
            _ => return Err(DecodeError::malformed("APPEND target", offset)),
        }
        Ok(())
    }

    fn extend_dict(&mut self, pairs: Vec<(Value, Value)>, offset: usize) -> DecodeResult<()> {
        let target = self.top_object(offset)?;
        match self.heap.get_mut(target) {
            Some(Object::Dict(dict)) => dict.extend(pairs),
            Some(Object::Instance(instance)) => instance.dict_items.extend(pairs),
            _ => return Err(DecodeError::malformed("SETITEM target", offset)),
        }
        Ok(())
    }

    fn memoize(&mut self, key: u64, offset: usize) -> DecodeResult<()> {
        let value = self.top(offset)?.clone();
        self.memo.insert(key, value);
        Ok(())
    }

    fn recall(&mut self, key: u64, offset: usize) -> DecodeResult<()> {
        let value = self
            .memo
            .get(&key)
            .cloned()
            .ok_or(DecodeError::BadMemoKey { key, offset })?;
        self.stack.push(value);
        Ok(())
    }

    fn push_utf8(&mut self, len: usize, offset: usize) -> DecodeResult<()> {
        let bytes = self.read_exact(len)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::malformed("utf-8 string", offset))?
            .to_string();
        self.stack.push(Value::Str(text));
        Ok(())
    }

    fn top(&self, offset: usize) -> DecodeResult<&Value> {
        self.stack.last().ok_or(DecodeError::StackUnderflow { offset })
    }

    fn top_object(&self, offset: usize) -> DecodeResult<ObjId> {
        self.top(offset)?
            .as_ref_id()
            .ok_or_else(|| DecodeError::malformed("mutation target", offset))
    }

    fn pop(&mut self, offset: usize) -> DecodeResult<Value> {
        if self.marks.last() == Some(&self.stack.len()) {
            return Err(DecodeError::StackUnderflow { offset });
        }
        self.stack.pop().ok_or(DecodeError::StackUnderflow { offset })
    }

    fn pop_mark(&mut self, offset: usize) -> DecodeResult<Vec<Value>> {
        let mark = self.marks.pop().ok_or(DecodeError::MissingMark { offset })?;
        if mark > self.stack.len() {
            return Err(DecodeError::StackUnderflow { offset });
        }
        Ok(self.stack.split_off(mark))
    }

    fn read_u8(&mut self) -> DecodeResult<u8> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or(DecodeError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_exact(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or(DecodeError::Truncated { offset: self.pos })?;
        let input: &'a [u8] = self.input;
        let bytes = &input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_exact(N)?);
        Ok(buf)
    }

    fn read_u64(&mut self) -> DecodeResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_u32_len(&mut self) -> DecodeResult<usize> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn read_u64_len(&mut self, offset: usize) -> DecodeResult<usize> {
        let len = self.read_u64()?;
        usize::try_from(len).map_err(|_| DecodeError::malformed("length", offset))
    }

    fn read_line(&mut self) -> DecodeResult<&'a [u8]> {
        let input: &'a [u8] = self.input;
        let rest = &input[self.pos.min(input.len())..];
        let newline = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(DecodeError::Truncated { offset: input.len() })?;
        self.pos += newline + 1;
        Ok(&rest[..newline])
    }

    fn read_text_line(&mut self, offset: usize) -> DecodeResult<&'a str> {
        let line = self.read_line()?;
        std::str::from_utf8(line).map_err(|_| DecodeError::malformed("text line", offset))
    }
}

fn into_pairs(items: Vec<Value>) -> Option<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return None;
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Some(pairs)
}

fn parse_decimal(text: &str) -> Option<Value> {
    if let Ok(value) = text.parse::<i64>() {
        return Some(Value::Int(value));
    }
    text.parse::<i128>().ok().map(|value| Value::Long(long_bytes(value)))
}

/// Decode the quoted `repr` operand of a protocol 0 `STRING`
fn unquote_legacy(line: &[u8]) -> Option<Vec<u8>> {
    let (&first, rest) = line.split_first()?;
    let (&last, body) = rest.split_last()?;
    if first != last || !(first == b'\'' || first == b'"') {
        return None;
    }
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let escaped = *body.get(i)?;
        i += 1;
        match escaped {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\\' | b'\'' | b'"' => out.push(escaped),
            b'\n' => {}
            b'x' => {
                let hex = std::str::from_utf8(body.get(i..i + 2)?).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = u32::from(escaped - b'0');
                for _ in 0..2 {
                    match body.get(i) {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                        }
                        _ => break,
                    }
                }
                out.push(u8::try_from(value & 0xff).ok()?);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Some(out)
}

/// Decode the `raw-unicode-escape` operand of a protocol 0 `UNICODE`
fn raw_unicode_unescape(line: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == b'\\' {
            let width = match line.get(i + 1) {
                Some(b'u') => Some(4),
                Some(b'U') => Some(8),
                _ => None,
            };
            if let Some(width) = width {
                let hex = std::str::from_utf8(line.get(i + 2..i + 2 + width)?).ok()?;
                out.push(char::from_u32(u32::from_str_radix(hex, 16).ok()?)?);
                i += 2 + width;
                continue;
            }
        }
        out.push(char::from(b));
        i += 1;
    }
    Some(out)
}
