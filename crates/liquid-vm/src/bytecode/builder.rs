//! Builder for emitting bytecode during compilation.
//!
//! `CodeBuilder` encodes opcodes and operands into raw bytes, interns string
//! constants, collects the runtime node table and tracks the operand stack
//! depth so the finished [`Code`] knows how deep its stack gets.

use std::sync::Arc;

use ahash::AHashMap;

use super::{
    code::{Code, Constant},
    op::{Opcode, WRITE_RAW_MAX, WRITE_RAW_W_MAX, decode_argc},
};
use crate::{
    error::{LiquidError, ParseResult},
    tag::Tag,
};

/// Builder for emitting bytecode during compilation.
///
/// # Usage
///
/// ```ignore
/// let mut builder = CodeBuilder::new();
/// let name = builder.add_str_const("product")?;
/// builder.emit_u16(Opcode::FindStaticVar, name);
/// builder.emit(Opcode::PopWrite);
/// builder.emit(Opcode::Leave);
/// let code = builder.build();
/// ```
#[derive(Debug, Default)]
pub struct CodeBuilder {
    /// The bytecode being built.
    bytecode: Vec<u8>,

    /// Constants collected during compilation.
    constants: Vec<Constant>,

    /// Pool index of each interned string constant.
    string_constants: AHashMap<Arc<str>, u16>,

    /// Tags referenced by `write_node`.
    nodes: Vec<Arc<dyn Tag>>,

    /// Current stack depth for tracking max stack usage.
    current_stack_depth: u16,

    /// Maximum stack depth seen during compilation.
    max_stack_depth: u16,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits a no-operand instruction and updates stack depth tracking.
    pub fn emit(&mut self, op: Opcode) {
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u8 operand and updates stack depth tracking.
    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
        // hash_new pops a key and a value per pair and pushes the mapping
        if op == Opcode::HashNew {
            self.adjust_stack(1 - 2 * i16::from(operand));
        } else if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with an i8 operand and updates stack depth tracking.
    pub fn emit_i8(&mut self, op: Opcode, operand: i8) {
        self.bytecode.push(op as u8);
        // Reinterpret i8 as u8 for bytecode encoding
        self.bytecode.push(operand.to_ne_bytes()[0]);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u16 operand (little-endian) and updates stack depth tracking.
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with an i16 operand (little-endian) and updates stack depth tracking.
    pub fn emit_i16(&mut self, op: Opcode, operand: i16) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u24 operand (little-endian).
    ///
    /// Used for `render_variable_rescue`; values past 24 bits saturate.
    pub fn emit_u24(&mut self, op: Opcode, operand: u32) {
        let operand = operand.min(0x00ff_ffff);
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes()[..3]);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits a `filter` call: name constant (u16) followed by argc (u8).
    pub fn emit_u16_u8(&mut self, op: Opcode, operand1: u16, operand2: u8) {
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand1.to_le_bytes());
        self.bytecode.push(operand2);
        self.track_filter_effect(op, operand2);
    }

    /// Emits a `builtin_filter` call: filter id (u8) followed by argc (u8).
    pub fn emit_u8_u8(&mut self, op: Opcode, operand1: u8, operand2: u8) {
        self.bytecode.push(op as u8);
        self.bytecode.push(operand1);
        self.bytecode.push(operand2);
        self.track_filter_effect(op, operand2);
    }

    /// Emits raw text, picking the narrow form when the text fits its length byte.
    ///
    /// Text longer than the wide form's limit is split across several
    /// instructions at character boundaries.
    pub fn emit_write_raw(&mut self, mut text: &str) {
        while !text.is_empty() {
            let chunk = if text.len() <= WRITE_RAW_W_MAX {
                text
            } else {
                let mut end = WRITE_RAW_W_MAX;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                &text[..end]
            };
            let len = chunk.len();
            if len <= WRITE_RAW_MAX {
                self.bytecode.push(Opcode::WriteRaw as u8);
                self.bytecode.extend_from_slice(&len.to_le_bytes()[..1]);
            } else {
                self.bytecode.push(Opcode::WriteRawW as u8);
                self.bytecode.extend_from_slice(&len.to_le_bytes()[..3]);
            }
            self.bytecode.extend_from_slice(chunk.as_bytes());
            text = &text[len..];
        }
    }

    /// Adds a constant to the pool, returning its index.
    ///
    /// String constants are interned so repeated names share one entry.
    pub fn add_const(&mut self, constant: Constant) -> ParseResult<u16> {
        if let Constant::Str(s) = &constant
            && let Some(&idx) = self.string_constants.get(s)
        {
            return Ok(idx);
        }
        let idx = u16::try_from(self.constants.len())
            .map_err(|_| LiquidError::syntax("template exceeds the limit of 65536 constants"))?;
        if let Constant::Str(s) = &constant {
            self.string_constants.insert(Arc::clone(s), idx);
        }
        self.constants.push(constant);
        Ok(idx)
    }

    /// Adds a string constant, returning its index.
    pub fn add_str_const(&mut self, s: &str) -> ParseResult<u16> {
        if let Some(&idx) = self.string_constants.get(s) {
            return Ok(idx);
        }
        self.add_const(Constant::Str(Arc::from(s)))
    }

    /// Adds a tag to the node table, returning its index.
    pub fn add_node(&mut self, node: Arc<dyn Tag>) -> ParseResult<u16> {
        let idx = u16::try_from(self.nodes.len())
            .map_err(|_| LiquidError::syntax("template exceeds the limit of 65536 tags per block"))?;
        self.nodes.push(node);
        Ok(idx)
    }

    /// Returns the current bytecode offset.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Returns the current tracked stack depth.
    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.current_stack_depth
    }

    /// Builds the final Code object.
    #[must_use]
    pub fn build(self) -> Code {
        Code::new(self.bytecode, self.constants, self.nodes, self.max_stack_depth)
    }

    fn track_filter_effect(&mut self, op: Opcode, argc: u8) {
        if matches!(op, Opcode::Filter | Opcode::BuiltinFilter) {
            // pops the input and arguments, pushes the result
            let (argc, _) = decode_argc(argc);
            self.adjust_stack(1 - i16::try_from(argc).unwrap_or(i16::MAX));
        } else if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Adjusts the tracked stack depth by `delta`.
    fn adjust_stack(&mut self, delta: i16) {
        let new_depth = i32::from(self.current_stack_depth) + i32::from(delta);
        // Stack depth shouldn't go negative (indicates compiler bug)
        debug_assert!(new_depth >= 0, "Stack depth went negative: {new_depth}");
        self.current_stack_depth = u16::try_from(new_depth.max(0)).unwrap_or(u16::MAX);
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_basic() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::PushNil);
        builder.emit(Opcode::PopWrite);

        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::PushNil as u8, Opcode::PopWrite as u8]);
        assert_eq!(code.max_stack_size(), 1);
    }

    #[test]
    fn test_emit_i8_operand() {
        let mut builder = CodeBuilder::new();
        builder.emit_i8(Opcode::PushInt8, -2);

        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::PushInt8 as u8, 0xfe]);
    }

    #[test]
    fn test_emit_u16_operand() {
        let mut builder = CodeBuilder::new();
        builder.emit_u16(Opcode::PushConst, 0x1234);

        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::PushConst as u8, 0x34, 0x12]);
    }

    #[test]
    fn test_emit_u24_operand() {
        let mut builder = CodeBuilder::new();
        builder.emit_u24(Opcode::RenderVariableRescue, 0x0001_0203);

        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::RenderVariableRescue as u8, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_write_raw_widths() {
        let mut builder = CodeBuilder::new();
        builder.emit_write_raw("ab");
        let long = "x".repeat(300);
        builder.emit_write_raw(&long);

        let code = builder.build();
        let bytes = code.bytecode();
        assert_eq!(&bytes[..4], &[Opcode::WriteRaw as u8, 2, b'a', b'b']);
        assert_eq!(&bytes[4..8], &[Opcode::WriteRawW as u8, 0x2c, 0x01, 0x00]);
        assert_eq!(bytes.len(), 8 + 300);
    }

    #[test]
    fn test_empty_text_emits_nothing() {
        let mut builder = CodeBuilder::new();
        builder.emit_write_raw("");
        assert_eq!(builder.current_offset(), 0);
    }

    #[test]
    fn test_string_constants_are_interned() {
        let mut builder = CodeBuilder::new();
        let a = builder.add_str_const("name").unwrap();
        let b = builder.add_const(Constant::Int(1)).unwrap();
        let c = builder.add_str_const("name").unwrap();
        assert_eq!((a, b, c), (0, 1, 0));
        assert_eq!(builder.build().constants().len(), 2);
    }

    #[test]
    fn test_filter_stack_tracking() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::PushNil);
        builder.emit_i8(Opcode::PushInt8, 1);
        builder.emit_i8(Opcode::PushInt8, 2);
        builder.emit_u16_u8(Opcode::Filter, 0, 3);
        assert_eq!(builder.stack_depth(), 1);
        assert_eq!(builder.build().max_stack_size(), 3);
    }

    #[test]
    fn test_hash_new_stack_tracking() {
        let mut builder = CodeBuilder::new();
        for _ in 0..4 {
            builder.emit(Opcode::PushNil);
        }
        builder.emit_u8(Opcode::HashNew, 2);
        assert_eq!(builder.stack_depth(), 1);
    }
}
