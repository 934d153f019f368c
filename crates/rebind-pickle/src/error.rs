//! Error types for pickle decoding and encoding

/// Error returned by a load hook
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors while reading a pickle
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Input ended before `STOP`
    #[error("unexpected end of pickle data at offset {offset}")]
    Truncated { offset: usize },

    /// Byte does not name an opcode
    #[error("unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    /// Opcode exists but is not supported here
    #[error("unsupported opcode {name} at offset {offset}")]
    UnsupportedOpcode { name: &'static str, offset: usize },

    /// `PROTO` announced a protocol newer than 5
    #[error("unsupported pickle protocol {0}")]
    UnsupportedProtocol(u8),

    /// Opcode needed more stack items than available
    #[error("stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },

    /// Opcode needed a mark and none was set
    #[error("no mark on the stack at offset {offset}")]
    MissingMark { offset: usize },

    /// Memo lookup for an index never stored
    #[error("memo key {key} not found at offset {offset}")]
    BadMemoKey { key: u64, offset: usize },

    /// Operand or operand target has the wrong shape
    #[error("malformed {what} at offset {offset}")]
    Malformed { what: String, offset: usize },

    /// A global or persistent-id hook rejected its input
    #[error("load hook failed: {0}")]
    Hook(HookError),
}

impl DecodeError {
    /// Create malformed-operand error
    pub fn malformed(what: impl Into<String>, offset: usize) -> Self {
        Self::Malformed {
            what: what.into(),
            offset,
        }
    }
}

/// Errors while writing a pickle
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// Protocol outside the writable range
    #[error("cannot write pickle protocol {0}, supported range is 2..=4")]
    UnsupportedProtocol(u8),

    /// Global cannot be spelled with the target protocol
    #[error("cannot write global {module}.{name}: {reason}")]
    IrreproducibleGlobal {
        module: String,
        name: String,
        reason: &'static str,
    },

    /// Value kind has no encoding at the target protocol
    #[error("{what} cannot be written with protocol {protocol}")]
    UnsupportedAtProtocol { what: &'static str, protocol: u8 },

    /// Object is reachable from its own construction arguments
    #[error("object {0} is reachable from its own constructor arguments")]
    RecursiveConstruct(usize),

    /// Reference to an object missing from the heap
    #[error("dangling heap reference {0}")]
    DanglingRef(usize),
}

/// Result type alias for decoding
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Result type alias for encoding
pub type EmitResult<T> = Result<T, EmitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_display() {
        let err = DecodeError::UnknownOpcode {
            opcode: 0xff,
            offset: 3,
        };
        assert_eq!(err.to_string(), "unknown opcode 0xff at offset 3");
    }

    #[test]
    fn emit_error_display() {
        let err = EmitError::IrreproducibleGlobal {
            module: "a\nb".to_string(),
            name: "C".to_string(),
            reason: "newline in module",
        };
        assert!(err.to_string().contains("newline in module"));
    }

    #[test]
    fn hook_error_keeps_inner() {
        let inner: HookError = "unknown reference format".into();
        let err = DecodeError::Hook(inner);
        assert_eq!(err.to_string(), "load hook failed: unknown reference format");
    }
}
