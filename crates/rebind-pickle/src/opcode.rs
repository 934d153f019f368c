//! Pickle opcode table
//!
//! Every opcode understood by protocols 0 through 5. Dispatch in the reader
//! and writer matches exhaustively on [`Opcode`].

/// A single pickle opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    // Protocol 0 and 1
    Mark,
    Stop,
    Pop,
    PopMark,
    Dup,
    Float,
    Int,
    BinInt,
    BinInt1,
    Long,
    BinInt2,
    None,
    PersId,
    BinPersId,
    Reduce,
    String,
    BinString,
    ShortBinString,
    Unicode,
    BinUnicode,
    Append,
    Build,
    Global,
    Dict,
    EmptyDict,
    Appends,
    Get,
    BinGet,
    Inst,
    LongBinGet,
    List,
    EmptyList,
    Obj,
    Put,
    BinPut,
    LongBinPut,
    SetItem,
    Tuple,
    EmptyTuple,
    SetItems,
    BinFloat,

    // Protocol 2
    Proto,
    NewObj,
    Ext1,
    Ext2,
    Ext4,
    Tuple1,
    Tuple2,
    Tuple3,
    NewTrue,
    NewFalse,
    Long1,
    Long4,

    // Protocol 3
    BinBytes,
    ShortBinBytes,

    // Protocol 4
    ShortBinUnicode,
    BinUnicode8,
    BinBytes8,
    EmptySet,
    AddItems,
    FrozenSet,
    NewObjEx,
    StackGlobal,
    Memoize,
    Frame,

    // Protocol 5
    ByteArray8,
    NextBuffer,
    ReadonlyBuffer,
}

impl Opcode {
    /// Decode an opcode byte
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        let op = match byte {
            b'(' => Self::Mark,
            b'.' => Self::Stop,
            b'0' => Self::Pop,
            b'1' => Self::PopMark,
            b'2' => Self::Dup,
            b'F' => Self::Float,
            b'I' => Self::Int,
            b'J' => Self::BinInt,
            b'K' => Self::BinInt1,
            b'L' => Self::Long,
            b'M' => Self::BinInt2,
            b'N' => Self::None,
            b'P' => Self::PersId,
            b'Q' => Self::BinPersId,
            b'R' => Self::Reduce,
            b'S' => Self::String,
            b'T' => Self::BinString,
            b'U' => Self::ShortBinString,
            b'V' => Self::Unicode,
            b'X' => Self::BinUnicode,
            b'a' => Self::Append,
            b'b' => Self::Build,
            b'c' => Self::Global,
            b'd' => Self::Dict,
            b'}' => Self::EmptyDict,
            b'e' => Self::Appends,
            b'g' => Self::Get,
            b'h' => Self::BinGet,
            b'i' => Self::Inst,
            b'j' => Self::LongBinGet,
            b'l' => Self::List,
            b']' => Self::EmptyList,
            b'o' => Self::Obj,
            b'p' => Self::Put,
            b'q' => Self::BinPut,
            b'r' => Self::LongBinPut,
            b's' => Self::SetItem,
            b't' => Self::Tuple,
            b')' => Self::EmptyTuple,
            b'u' => Self::SetItems,
            b'G' => Self::BinFloat,
            0x80 => Self::Proto,
            0x81 => Self::NewObj,
            0x82 => Self::Ext1,
            0x83 => Self::Ext2,
            0x84 => Self::Ext4,
            0x85 => Self::Tuple1,
            0x86 => Self::Tuple2,
            0x87 => Self::Tuple3,
            0x88 => Self::NewTrue,
            0x89 => Self::NewFalse,
            0x8a => Self::Long1,
            0x8b => Self::Long4,
            b'B' => Self::BinBytes,
            b'C' => Self::ShortBinBytes,
            0x8c => Self::ShortBinUnicode,
            0x8d => Self::BinUnicode8,
            0x8e => Self::BinBytes8,
            0x8f => Self::EmptySet,
            0x90 => Self::AddItems,
            0x91 => Self::FrozenSet,
            0x92 => Self::NewObjEx,
            0x93 => Self::StackGlobal,
            0x94 => Self::Memoize,
            0x95 => Self::Frame,
            0x96 => Self::ByteArray8,
            0x97 => Self::NextBuffer,
            0x98 => Self::ReadonlyBuffer,
            _ => return Option::None,
        };
        Some(op)
    }

    /// Encoded byte for this opcode
    #[must_use]
    pub const fn byte(self) -> u8 {
        match self {
            Self::Mark => b'(',
            Self::Stop => b'.',
            Self::Pop => b'0',
            Self::PopMark => b'1',
            Self::Dup => b'2',
            Self::Float => b'F',
            Self::Int => b'I',
            Self::BinInt => b'J',
            Self::BinInt1 => b'K',
            Self::Long => b'L',
            Self::BinInt2 => b'M',
            Self::None => b'N',
            Self::PersId => b'P',
            Self::BinPersId => b'Q',
            Self::Reduce => b'R',
            Self::String => b'S',
            Self::BinString => b'T',
            Self::ShortBinString => b'U',
            Self::Unicode => b'V',
            Self::BinUnicode => b'X',
            Self::Append => b'a',
            Self::Build => b'b',
            Self::Global => b'c',
            Self::Dict => b'd',
            Self::EmptyDict => b'}',
            Self::Appends => b'e',
            Self::Get => b'g',
            Self::BinGet => b'h',
            Self::Inst => b'i',
            Self::LongBinGet => b'j',
            Self::List => b'l',
            Self::EmptyList => b']',
            Self::Obj => b'o',
            Self::Put => b'p',
            Self::BinPut => b'q',
            Self::LongBinPut => b'r',
            Self::SetItem => b's',
            Self::Tuple => b't',
            Self::EmptyTuple => b')',
            Self::SetItems => b'u',
            Self::BinFloat => b'G',
            Self::Proto => 0x80,
            Self::NewObj => 0x81,
            Self::Ext1 => 0x82,
            Self::Ext2 => 0x83,
            Self::Ext4 => 0x84,
            Self::Tuple1 => 0x85,
            Self::Tuple2 => 0x86,
            Self::Tuple3 => 0x87,
            Self::NewTrue => 0x88,
            Self::NewFalse => 0x89,
            Self::Long1 => 0x8a,
            Self::Long4 => 0x8b,
            Self::BinBytes => b'B',
            Self::ShortBinBytes => b'C',
            Self::ShortBinUnicode => 0x8c,
            Self::BinUnicode8 => 0x8d,
            Self::BinBytes8 => 0x8e,
            Self::EmptySet => 0x8f,
            Self::AddItems => 0x90,
            Self::FrozenSet => 0x91,
            Self::NewObjEx => 0x92,
            Self::StackGlobal => 0x93,
            Self::Memoize => 0x94,
            Self::Frame => 0x95,
            Self::ByteArray8 => 0x96,
            Self::NextBuffer => 0x97,
            Self::ReadonlyBuffer => 0x98,
        }
    }

    /// Lowest protocol that defines this opcode
    #[must_use]
    pub const fn since_protocol(self) -> u8 {
        match self {
            Self::Proto
            | Self::NewObj
            | Self::Ext1
            | Self::Ext2
            | Self::Ext4
            | Self::Tuple1
            | Self::Tuple2
            | Self::Tuple3
            | Self::NewTrue
            | Self::NewFalse
            | Self::Long1
            | Self::Long4 => 2,
            Self::BinBytes | Self::ShortBinBytes => 3,
            Self::ShortBinUnicode
            | Self::BinUnicode8
            | Self::BinBytes8
            | Self::EmptySet
            | Self::AddItems
            | Self::FrozenSet
            | Self::NewObjEx
            | Self::StackGlobal
            | Self::Memoize
            | Self::Frame => 4,
            Self::ByteArray8 | Self::NextBuffer | Self::ReadonlyBuffer => 5,
            _ => 0,
        }
    }
}
