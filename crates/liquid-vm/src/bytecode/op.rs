//! Opcode definitions for the template VM.
//!
//! Instructions are a single opcode byte followed by fixed-width operands,
//! except the raw-text writes whose text is stored inline after a length
//! field. Multi-byte operands are little-endian.

use std::fmt;

/// Bit of a filter argc operand marking a trailing keyword-argument map.
pub const KEYWORD_ARGS_FLAG: u8 = 0x80;

/// Largest text a single `write_raw` can carry.
pub const WRITE_RAW_MAX: usize = u8::MAX as usize;

/// Largest text a single `write_raw_w` can carry; longer text is split.
pub const WRITE_RAW_W_MAX: usize = (1 << 24) - 1;

/// Template VM opcode.
///
/// The operand layout of each opcode is listed with its variant.
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::FromRepr,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    /// End of program. Expression programs return the top of stack.
    Leave,
    /// `len: u8`, then `len` bytes of text.
    WriteRaw,
    /// `len: u24`, then `len` bytes of text.
    WriteRawW,
    /// `node: u16` index into the node table.
    WriteNode,
    /// Pops a value and writes it; closes a `render_variable_rescue` region.
    PopWrite,
    PushNil,
    PushTrue,
    PushFalse,
    /// `value: i8`
    PushInt8,
    /// `value: i16`
    PushInt16,
    /// `index: u16` into the constant pool.
    PushConst,
    /// `name: u16` constant; pushes the variable.
    FindStaticVar,
    /// Pops a key, pushes the variable it names.
    FindVar,
    /// `key: u16` constant; replaces the receiver with `receiver[key]`.
    LookupConstKey,
    /// Pops key and receiver, pushes `receiver[key]`.
    LookupKey,
    /// `name: u16` constant; replaces the receiver with `receiver.name`.
    LookupCommand,
    /// Pops end and start, pushes the inclusive integer range.
    NewIntRange,
    /// `pairs: u8`; pops alternating keys and values, pushes the mapping.
    HashNew,
    /// `name: u16` constant, `argc: u8` stack values including the input.
    Filter,
    /// `id: u8` built-in filter, `argc: u8`.
    BuiltinFilter,
    /// `line: u24` (0 when unknown); opens a guarded region ending at `pop_write`.
    RenderVariableRescue,
}

/// Error returned when a byte is not a valid opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcodeError(pub u8);

impl fmt::Display for InvalidOpcodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid opcode: {}", self.0)
    }
}

impl std::error::Error for InvalidOpcodeError {}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcodeError(byte))
    }
}

impl Opcode {
    /// Net stack effect for opcodes whose effect does not depend on operands.
    ///
    /// Returns `None` for `hash_new` and the filter calls.
    #[must_use]
    pub const fn stack_effect(self) -> Option<i16> {
        Some(match self {
            Self::Leave
            | Self::WriteRaw
            | Self::WriteRawW
            | Self::WriteNode
            | Self::RenderVariableRescue
            | Self::FindVar
            | Self::LookupConstKey
            | Self::LookupCommand => 0,
            Self::PopWrite | Self::LookupKey | Self::NewIntRange => -1,
            Self::PushNil
            | Self::PushTrue
            | Self::PushFalse
            | Self::PushInt8
            | Self::PushInt16
            | Self::PushConst
            | Self::FindStaticVar => 1,
            Self::HashNew | Self::Filter | Self::BuiltinFilter => return None,
        })
    }

    /// Width of the fixed operands following the opcode byte.
    ///
    /// For the raw writes this is the width of the length field; the inline
    /// text follows it.
    #[must_use]
    pub const fn operand_width(self) -> usize {
        match self {
            Self::Leave
            | Self::PopWrite
            | Self::PushNil
            | Self::PushTrue
            | Self::PushFalse
            | Self::FindVar
            | Self::LookupKey
            | Self::NewIntRange => 0,
            Self::WriteRaw | Self::PushInt8 | Self::HashNew => 1,
            Self::WriteNode
            | Self::PushInt16
            | Self::PushConst
            | Self::FindStaticVar
            | Self::LookupConstKey
            | Self::LookupCommand
            | Self::BuiltinFilter => 2,
            Self::WriteRawW | Self::Filter | Self::RenderVariableRescue => 3,
        }
    }
}

/// Decodes a filter argc operand into `(stack values, has keyword map)`.
#[must_use]
pub fn decode_argc(argc: u8) -> (usize, bool) {
    (usize::from(argc & !KEYWORD_ARGS_FLAG), argc & KEYWORD_ARGS_FLAG != 0)
}

/// Reads a little-endian u24 operand.
#[must_use]
pub fn read_u24(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn opcodes_round_trip_through_bytes() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::try_from(op as u8), Ok(op));
        }
        assert_eq!(Opcode::try_from(200), Err(InvalidOpcodeError(200)));
    }

    #[test]
    fn names_are_snake_case() {
        assert_eq!(Opcode::FindStaticVar.to_string(), "find_static_var");
        assert_eq!(<&str>::from(Opcode::WriteRawW), "write_raw_w");
    }

    #[test]
    fn argc_flag() {
        assert_eq!(decode_argc(3), (3, false));
        assert_eq!(decode_argc(3 | KEYWORD_ARGS_FLAG), (3, true));
    }
}
