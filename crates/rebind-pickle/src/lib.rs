//! rebind pickle codec
//!
//! Reads and writes the pickle object-graph format without executing it.
//!
//! # Core Concepts
//!
//! - [`Value`]: inline values (numbers, strings, tuples, globals, persistent references)
//! - [`Heap`]: arena for identity-bearing objects (lists, dicts, sets, instances)
//! - [`Unpickler`]: decoder with a memo shared across consecutive pickles
//! - [`LoadHooks`]: interception of class lookups and persistent ids
//! - [`Pickler`]: encoder choosing the same opcodes as the Python pickler
//!
//! # Example
//!
//! ```rust
//! use rebind_pickle::{dump_all, load_all, Protocol};
//!
//! let record = b"\x80\x03cmodule1\nFactory\nq\x00.\x80\x03}q\x01.";
//! let (values, heap) = load_all(record)?;
//! assert_eq!(values.len(), 2);
//!
//! let written = dump_all(&values, &heap, Protocol::V3)?;
//! assert_eq!(written, record.to_vec());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(unreachable_pub)]

mod error;
mod opcode;
mod reader;
mod value;
mod writer;

pub use error::{DecodeError, DecodeResult, EmitError, EmitResult, HookError};
pub use opcode::Opcode;
pub use reader::{LoadHooks, PlainHooks, Unpickler};
pub use value::{dict_get, dict_get_mut, Construct, Global, Heap, Instance, ObjId, Object, Value};
pub use writer::{Pickler, Protocol};

/// Decode every pickle in `input` with [`PlainHooks`]
///
/// # Errors
/// Returns error on malformed input.
pub fn load_all(input: &[u8]) -> DecodeResult<(Vec<Value>, Heap)> {
    let mut unpickler = Unpickler::new(input, PlainHooks);
    let mut values = Vec::new();
    while !unpickler.is_at_end() {
        values.push(unpickler.load()?);
    }
    Ok((values, unpickler.into_heap()))
}

/// Encode `values` as consecutive pickles sharing one memo
///
/// # Errors
/// Returns error if a value cannot be written at `protocol`.
pub fn dump_all(values: &[Value], heap: &Heap, protocol: Protocol) -> EmitResult<Vec<u8>> {
    let mut pickler = Pickler::new(protocol, heap);
    for value in values {
        pickler.dump(value)?;
    }
    Ok(pickler.finish())
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
