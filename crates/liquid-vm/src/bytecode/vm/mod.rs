//! Stack interpreter for compiled programs.
//!
//! The VM is a linear evaluator: there are no jumps. Control flow belongs to
//! tags, which the VM reaches through `write_node` and which re-enter the VM
//! to render their own bodies. One [`Vm`] runs one program against one
//! [`Context`]; nothing in the program is mutated, so a compiled template can
//! be rendered by many contexts at once.

mod call;

use smallvec::SmallVec;

use super::{
    code::{Code, instruction_len},
    op::{Opcode, read_u24},
};
use crate::{
    context::Context,
    error::{LiquidError, RenderResult},
    filter::BuiltinFilter,
    value::{Map, Value},
};

/// Renders a body program, appending its output to `output`.
pub fn render(code: &Code, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
    Vm::new(code).run(context, output).map(drop)
}

/// Evaluates an expression program and returns its value.
pub fn evaluate(code: &Code, context: &mut Context<'_>) -> RenderResult<Value> {
    let mut scratch = String::new();
    Vm::new(code)
        .run(context, &mut scratch)
        .map(Option::unwrap_or_default)
}

/// Fetches a byte from the bytecode, advancing ip.
macro_rules! fetch_byte {
    ($vm:expr) => {{
        let byte = $vm.code.bytecode()[$vm.ip];
        $vm.ip += 1;
        byte
    }};
}

/// Fetches a u8 operand.
macro_rules! fetch_u8 {
    ($vm:expr) => {
        fetch_byte!($vm)
    };
}

/// Fetches an i8 operand.
macro_rules! fetch_i8 {
    ($vm:expr) => {{ i8::from_ne_bytes([fetch_byte!($vm)]) }};
}

/// Fetches a u16 operand (little-endian).
macro_rules! fetch_u16 {
    ($vm:expr) => {{
        let lo = $vm.code.bytecode()[$vm.ip];
        let hi = $vm.code.bytecode()[$vm.ip + 1];
        $vm.ip += 2;
        u16::from_le_bytes([lo, hi])
    }};
}

/// Fetches an i16 operand (little-endian).
macro_rules! fetch_i16 {
    ($vm:expr) => {{
        let lo = $vm.code.bytecode()[$vm.ip];
        let hi = $vm.code.bytecode()[$vm.ip + 1];
        $vm.ip += 2;
        i16::from_le_bytes([lo, hi])
    }};
}

/// Fetches a u24 operand (little-endian).
macro_rules! fetch_u24 {
    ($vm:expr) => {{
        let value = read_u24(&$vm.code.bytecode()[$vm.ip..]);
        $vm.ip += 3;
        value
    }};
}

/// An open `render_variable_rescue` region.
#[derive(Debug, Clone, Copy)]
struct Rescue {
    /// Stack height when the region opened.
    stack_base: usize,
    line_number: Option<u32>,
}

/// What the run loop does after an instruction.
enum Flow {
    Next,
    Leave,
}

/// Per-run interpreter state.
pub(crate) struct Vm<'c> {
    code: &'c Code,
    ip: usize,
    stack: SmallVec<[Value; 8]>,
    rescue: Option<Rescue>,
}

impl<'c> Vm<'c> {
    fn new(code: &'c Code) -> Self {
        Self {
            code,
            ip: 0,
            stack: SmallVec::with_capacity(usize::from(code.max_stack_size())),
            rescue: None,
        }
    }

    /// Main execution loop.
    ///
    /// Returns the top of stack at `leave`, which is the value of an
    /// expression program and `None` for body programs.
    fn run(&mut self, context: &mut Context<'_>, output: &mut String) -> RenderResult<Option<Value>> {
        while self.ip < self.code.bytecode().len() {
            let ip = self.ip;
            let opcode = Opcode::try_from(fetch_byte!(self)).map_err(|err| LiquidError::standard(err.to_string()))?;

            if let Some(tracer) = context.tracer() {
                tracer.on_instruction(ip, opcode, self.stack.len());
            }

            match self.step(opcode, context, output) {
                Ok(Flow::Next) => {}
                Ok(Flow::Leave) => return Ok(self.stack.pop()),
                Err(err) => self.recover(err, context, output)?,
            }
        }
        Ok(self.stack.pop())
    }

    fn step(&mut self, opcode: Opcode, context: &mut Context<'_>, output: &mut String) -> RenderResult<Flow> {
        let code = self.code;
        match opcode {
            // ============================================================
            // Output
            // ============================================================
            Opcode::Leave => return Ok(Flow::Leave),
            Opcode::WriteRaw => {
                let len = usize::from(fetch_u8!(self));
                self.write_raw(len, context, output)?;
            }
            Opcode::WriteRawW => {
                let len = usize::try_from(fetch_u24!(self)).unwrap_or(usize::MAX);
                self.write_raw(len, context, output)?;
            }
            Opcode::WriteNode => {
                let node = code.node(fetch_u16!(self));
                if let Some(tracer) = context.tracer() {
                    tracer.on_node(node.name(), node.line_number());
                }
                if let Err(err) = node.render(context, output) {
                    let text = context.handle_error(err, node.line_number())?;
                    output.push_str(&text);
                }
                context.increment_write_score(output.len())?;
                if context.has_interrupt() {
                    return Ok(Flow::Leave);
                }
            }
            Opcode::PopWrite => {
                let value = self.pop();
                let written = context.write_value(&value, output);
                let rescue = self.rescue.take();
                if let Err(err) = written {
                    // the region ends here, so recover in place rather than scanning ahead
                    let Some(rescue) = rescue else { return Err(err) };
                    let text = context.handle_error(err, rescue.line_number)?;
                    output.push_str(&text);
                }
                context.increment_write_score(output.len())?;
            }
            Opcode::RenderVariableRescue => {
                let line = fetch_u24!(self);
                self.rescue = Some(Rescue {
                    stack_base: self.stack.len(),
                    line_number: (line != 0).then_some(line),
                });
            }

            // ============================================================
            // Constants
            // ============================================================
            Opcode::PushNil => self.push(Value::Nil),
            Opcode::PushTrue => self.push(Value::Bool(true)),
            Opcode::PushFalse => self.push(Value::Bool(false)),
            Opcode::PushInt8 => {
                let value = fetch_i8!(self);
                self.push(Value::Int(i64::from(value)));
            }
            Opcode::PushInt16 => {
                let value = fetch_i16!(self);
                self.push(Value::Int(i64::from(value)));
            }
            Opcode::PushConst => {
                let constant = code.constant(fetch_u16!(self));
                self.push(constant.to_value());
            }

            // ============================================================
            // Variable Lookups
            // ============================================================
            Opcode::FindStaticVar => {
                let name = code.constant(fetch_u16!(self)).as_str().unwrap_or_default();
                let value = context.find_variable(name, true)?;
                self.push(value);
            }
            Opcode::FindVar => {
                let key = self.pop();
                let value = context.find_dynamic_variable(&key)?;
                self.push(value);
            }
            Opcode::LookupConstKey => {
                let key = code.constant(fetch_u16!(self)).to_value();
                let receiver = self.pop();
                let value = context.lookup_key(&receiver, &key)?;
                self.push(value);
            }
            Opcode::LookupKey => {
                let key = self.pop();
                let receiver = self.pop();
                let value = context.lookup_key(&receiver, &key)?;
                self.push(value);
            }
            Opcode::LookupCommand => {
                let name = code.constant(fetch_u16!(self)).as_str().unwrap_or_default();
                let receiver = self.pop();
                let value = context.lookup_command(&receiver, name)?;
                self.push(value);
            }

            // ============================================================
            // Containers
            // ============================================================
            Opcode::NewIntRange => {
                let end = self.pop();
                let start = self.pop();
                let range = Value::Range(Context::range_bound(&start)?, Context::range_bound(&end)?);
                self.push(range);
            }
            Opcode::HashNew => {
                let pairs = usize::from(fetch_u8!(self));
                let start = self.stack.len() - 2 * pairs;
                let mut map = Map::with_capacity(pairs);
                let mut items = self.stack.drain(start..);
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    let key = match key {
                        Value::Str(s) => s.to_string(),
                        other => other.to_string(),
                    };
                    map.insert(key, value);
                }
                drop(items);
                self.push(Value::map(map));
            }

            // ============================================================
            // Filters
            // ============================================================
            Opcode::Filter => {
                let name = code.constant(fetch_u16!(self)).as_str().unwrap_or_default();
                let argc = fetch_u8!(self);
                self.call_filter(context, call::FilterTarget::Named(name), argc)?;
            }
            Opcode::BuiltinFilter => {
                let id = fetch_u8!(self);
                let argc = fetch_u8!(self);
                let builtin = BuiltinFilter::from_repr(id)
                    .ok_or_else(|| LiquidError::standard(format!("unknown built-in filter id {id}")))?;
                self.call_filter(context, call::FilterTarget::Builtin(builtin), argc)?;
            }
        }
        Ok(Flow::Next)
    }

    fn write_raw(&mut self, len: usize, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        let bytes = &self.code.bytecode()[self.ip..self.ip + len];
        self.ip += len;
        let text = std::str::from_utf8(bytes).map_err(|err| LiquidError::standard(err.to_string()))?;
        output.push_str(text);
        context.increment_write_score(output.len())?;
        Ok(())
    }

    /// Handles an error raised by an instruction.
    ///
    /// Inside a rescue region a recoverable error unwinds the stack to the
    /// region start, writes whatever the context's error hook returns and
    /// resumes after the region's `pop_write`. Everything else propagates.
    fn recover(&mut self, err: LiquidError, context: &mut Context<'_>, output: &mut String) -> RenderResult<()> {
        let Some(rescue) = self.rescue.take() else {
            return Err(err);
        };
        if err.is_fatal() {
            return Err(err);
        }
        self.stack.truncate(rescue.stack_base);
        let text = context.handle_error(err, rescue.line_number)?;
        output.push_str(&text);
        self.skip_past_pop_write();
        context.increment_write_score(output.len())?;
        Ok(())
    }

    fn skip_past_pop_write(&mut self) {
        let bytecode = self.code.bytecode();
        while self.ip < bytecode.len() {
            let opcode = bytecode[self.ip];
            self.ip += instruction_len(bytecode, self.ip).unwrap_or(1);
            if opcode == Opcode::PopWrite as u8 {
                break;
            }
        }
    }

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pops the top of stack. Validated programs never pop an empty stack.
    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_default()
    }
}
