//! Lowers parsed expressions, variables and block nodes into bytecode.

use std::sync::Arc;

use super::{
    builder::CodeBuilder,
    code::{Code, Constant},
    op::{KEYWORD_ARGS_FLAG, Opcode},
};
use crate::{
    error::{LiquidError, ParseResult},
    expression::{Expression, FilterCall, IntLiteral, Variable, VariableLookup},
    filter::FilterRegistry,
    tag::{Lowering, Tag},
    value::Value,
};

/// Largest argc a filter call can encode, input and keyword map included.
const MAX_FILTER_ARGS: usize = (KEYWORD_ARGS_FLAG - 1) as usize;

/// Compiler for one program: a block body or a standalone expression.
///
/// Tags receive the compiler in [`Tag::compile`] and may emit through the
/// same `add_*` methods the block parser uses.
#[derive(Debug)]
pub struct Compiler<'e> {
    builder: CodeBuilder,
    /// Consulted for the built-in filter fast path; `None` always emits `filter`.
    filters: Option<&'e FilterRegistry>,
}

impl<'e> Compiler<'e> {
    #[must_use]
    pub fn new(filters: &'e FilterRegistry) -> Self {
        Self {
            builder: CodeBuilder::new(),
            filters: Some(filters),
        }
    }

    /// A compiler for expressions parsed without an environment.
    #[must_use]
    pub fn for_expression() -> Compiler<'static> {
        Compiler {
            builder: CodeBuilder::new(),
            filters: None,
        }
    }

    /// Low-level access for tags emitting custom instruction sequences.
    pub fn builder(&mut self) -> &mut CodeBuilder {
        &mut self.builder
    }

    /// Emits code leaving the value of `expression` on the stack.
    pub fn add_evaluate_expression(&mut self, expression: &Expression) -> ParseResult<()> {
        match expression {
            Expression::Nil => self.builder.emit(Opcode::PushNil),
            Expression::Bool(true) => self.builder.emit(Opcode::PushTrue),
            Expression::Bool(false) => self.builder.emit(Opcode::PushFalse),
            Expression::Int(IntLiteral::Small(i)) => self.push_int(*i)?,
            Expression::Int(big) => match big.to_value() {
                Value::Int(i) => self.push_int(i)?,
                value => self.push_constant_value(&value)?,
            },
            Expression::Float(f) => self.push_const(Constant::Float(*f))?,
            Expression::String(s) => self.push_const(Constant::Str(Arc::clone(s)).normalized())?,
            Expression::Range(start, end) => {
                if let Some(range) = expression.constant_value() {
                    self.push_constant_value(&range)?;
                } else {
                    self.add_evaluate_expression(start)?;
                    self.add_evaluate_expression(end)?;
                    self.builder.emit(Opcode::NewIntRange);
                }
            }
            Expression::Lookup(lookup) => self.add_variable_lookup(lookup)?,
            Expression::Compiled(compiled) => self.add_evaluate_expression(compiled.source())?,
        }
        Ok(())
    }

    fn add_variable_lookup(&mut self, lookup: &VariableLookup) -> ParseResult<()> {
        if let Expression::String(name) = &lookup.name {
            let idx = self.builder.add_const(Constant::Str(Arc::clone(name)).normalized())?;
            self.builder.emit_u16(Opcode::FindStaticVar, idx);
        } else {
            self.add_evaluate_expression(&lookup.name)?;
            self.builder.emit(Opcode::FindVar);
        }
        for segment in &lookup.lookups {
            match &segment.key {
                Expression::String(key) if segment.command => {
                    let idx = self.builder.add_str_const(key)?;
                    self.builder.emit_u16(Opcode::LookupCommand, idx);
                }
                Expression::String(key) => {
                    let idx = self.builder.add_const(Constant::Str(Arc::clone(key)).normalized())?;
                    self.builder.emit_u16(Opcode::LookupConstKey, idx);
                }
                key => {
                    self.add_evaluate_expression(key)?;
                    self.builder.emit(Opcode::LookupKey);
                }
            }
        }
        Ok(())
    }

    /// Emits a filter call on the value already on the stack.
    pub fn add_filter(&mut self, filter: &FilterCall) -> ParseResult<()> {
        for arg in &filter.args {
            self.add_evaluate_expression(arg)?;
        }
        let argc = filter.total_args();
        if argc > MAX_FILTER_ARGS {
            return Err(LiquidError::syntax(format!("too many arguments to filter '{}'", filter.name)));
        }
        let mut argc = u8::try_from(argc).unwrap_or(u8::MAX);
        if !filter.keyword_args.is_empty() {
            for (key, value) in &filter.keyword_args {
                let idx = self.builder.add_str_const(key)?;
                self.builder.emit_u16(Opcode::PushConst, idx);
                self.add_evaluate_expression(value)?;
            }
            // keyword pairs share the argc limit, so the count fits
            let pairs = u8::try_from(filter.keyword_args.len()).unwrap_or(u8::MAX);
            self.builder.emit_u8(Opcode::HashNew, pairs);
            argc |= KEYWORD_ARGS_FLAG;
        }
        match self.filters.and_then(|filters| filters.builtin_id(&filter.name)) {
            Some(builtin) => self.builder.emit_u8_u8(Opcode::BuiltinFilter, builtin as u8, argc),
            None => {
                let idx = self.builder.add_str_const(&filter.name)?;
                self.builder.emit_u16_u8(Opcode::Filter, idx, argc);
            }
        }
        Ok(())
    }

    /// Emits code leaving the filtered value of `variable` on the stack.
    pub fn add_variable(&mut self, variable: &Variable) -> ParseResult<()> {
        self.add_evaluate_expression(&variable.expression)?;
        for filter in &variable.filters {
            self.add_filter(filter)?;
        }
        Ok(())
    }

    /// Emits a guarded render of `variable`.
    ///
    /// An error raised inside the region is reported with `line_number` and
    /// rendering resumes after it.
    pub fn add_render_variable(&mut self, variable: &Variable, line_number: Option<u32>) -> ParseResult<()> {
        self.builder.emit_u24(Opcode::RenderVariableRescue, line_number.unwrap_or(0));
        self.add_variable(variable)?;
        self.builder.emit(Opcode::PopWrite);
        Ok(())
    }

    pub fn add_write_raw(&mut self, text: &str) {
        self.builder.emit_write_raw(text);
    }

    /// Emits a runtime dispatch of `tag`.
    pub fn add_write_node(&mut self, tag: Arc<dyn Tag>) -> ParseResult<()> {
        let idx = self.builder.add_node(tag)?;
        self.builder.emit_u16(Opcode::WriteNode, idx);
        Ok(())
    }

    /// Lets `tag` lower itself, falling back to runtime dispatch.
    pub fn add_tag(&mut self, tag: Arc<dyn Tag>) -> ParseResult<()> {
        match tag.compile(self)? {
            Lowering::RuntimeDispatch => self.add_write_node(tag),
            Lowering::Emitted => Ok(()),
        }
    }

    /// Terminates the program with `leave` and builds it.
    #[must_use]
    pub fn finish(mut self) -> Code {
        self.builder.emit(Opcode::Leave);
        self.builder.build()
    }

    fn push_int(&mut self, i: i64) -> ParseResult<()> {
        if let Ok(small) = i8::try_from(i) {
            self.builder.emit_i8(Opcode::PushInt8, small);
        } else if let Ok(medium) = i16::try_from(i) {
            self.builder.emit_i16(Opcode::PushInt16, medium);
        } else {
            self.push_const(Constant::Int(i))?;
        }
        Ok(())
    }

    fn push_constant_value(&mut self, value: &Value) -> ParseResult<()> {
        match Constant::from_value(value) {
            Some(constant) => self.push_const(constant),
            None => Err(LiquidError::syntax("expression has no constant form")),
        }
    }

    fn push_const(&mut self, constant: Constant) -> ParseResult<()> {
        let idx = self.builder.add_const(constant)?;
        self.builder.emit_u16(Opcode::PushConst, idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disassemble(markup: &str) -> String {
        let mut compiler = Compiler::for_expression();
        compiler
            .add_variable(&crate::parser::strict_parse_variable(markup).unwrap())
            .unwrap();
        compiler.finish().disassemble()
    }

    #[test]
    fn integer_tiers() {
        assert_eq!(disassemble("-128"), "0x0000: push_int8(-128)\n0x0002: leave\n");
        assert_eq!(disassemble("128"), "0x0000: push_int16(128)\n0x0003: leave\n");
        assert_eq!(disassemble("32768"), "0x0000: push_const(32768)\n0x0003: leave\n");
        assert_eq!(
            disassemble("12345678901234567890"),
            "0x0000: push_const(12345678901234567890)\n0x0003: leave\n"
        );
    }

    #[test]
    fn dynamic_filter_and_range() {
        assert_eq!(
            disassemble("(1..n) | join: ', '"),
            "0x0000: push_int8(1)\n\
             0x0002: find_static_var(\"n\")\n\
             0x0005: new_int_range\n\
             0x0006: push_const(\", \")\n\
             0x0009: filter(name: :join, num_args: 2)\n\
             0x000d: leave\n"
        );
    }

    #[test]
    fn commands_and_keys_differ() {
        assert_eq!(
            disassemble("a.size"),
            "0x0000: find_static_var(\"a\")\n0x0003: lookup_command(\"size\")\n0x0006: leave\n"
        );
        assert_eq!(
            disassemble("a['size']"),
            "0x0000: find_static_var(\"a\")\n0x0003: lookup_const_key(\"size\")\n0x0006: leave\n"
        );
    }
}
