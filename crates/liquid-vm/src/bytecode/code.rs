//! Compiled programs: bytecode, constant pool and node table.

use std::sync::Arc;

use num_bigint::BigInt;

use super::op::{Opcode, decode_argc, read_u24};
use crate::{
    error::{LiquidError, ParseResult},
    filter::BuiltinFilter,
    tag::Tag,
    value::Value,
};

/// A constant pool entry.
///
/// Pool entries are the only values a program references by index; small
/// integers and the nil/boolean literals are inlined in the stream instead.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Constant {
    Str(Arc<str>),
    /// The shared `empty`/`blank` literal, kept distinct from `''`.
    Empty,
    Int(i64),
    BigInt(Arc<BigInt>),
    Float(f64),
    Range(i64, i64),
}

impl Constant {
    /// Converts a constant expression value into a pool entry.
    ///
    /// Returns `None` for values that have no constant form.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Str(s) if Value::is_empty_literal_str(s) => Self::Empty,
            Value::Str(s) => Self::Str(Arc::clone(s)),
            Value::Int(i) => Self::Int(*i),
            Value::BigInt(i) => Self::BigInt(Arc::clone(i)),
            Value::Float(f) => Self::Float(*f),
            Value::Range(start, end) => Self::Range(*start, *end),
            _ => return None,
        })
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Str(s) => Value::Str(Arc::clone(s)),
            Self::Empty => Value::empty_literal(),
            Self::Int(i) => Value::Int(*i),
            Self::BigInt(i) => Value::BigInt(Arc::clone(i)),
            Self::Float(f) => Value::Float(*f),
            Self::Range(start, end) => Value::Range(*start, *end),
        }
    }

    /// Maps the shared `empty`/`blank` string to [`Constant::Empty`].
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Str(s) if Value::is_empty_literal_str(&s) => Self::Empty,
            other => other,
        }
    }

    /// String payload, for operands that name variables, keys or filters.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Empty => Some(""),
            _ => None,
        }
    }
}

/// Constants referenced by a program, in index order.
pub type ConstPool = Vec<Constant>;

/// An immutable compiled program.
///
/// Shared by every render of the template that owns it; the VM only reads it.
#[derive(Debug, Clone, Default)]
pub struct Code {
    bytecode: Vec<u8>,
    constants: ConstPool,
    /// Tags dispatched at runtime by `write_node`.
    nodes: Vec<Arc<dyn Tag>>,
    /// Deepest operand stack the program reaches.
    max_stack_size: u16,
}

impl Code {
    pub(crate) fn new(bytecode: Vec<u8>, constants: ConstPool, nodes: Vec<Arc<dyn Tag>>, max_stack_size: u16) -> Self {
        Self {
            bytecode,
            constants,
            nodes,
            max_stack_size,
        }
    }

    /// Reassembles a program from its parts, checking that it is well formed.
    ///
    /// Used when loading serialized templates, where the bytes are untrusted.
    pub fn from_parts(
        bytecode: Vec<u8>,
        constants: ConstPool,
        nodes: Vec<Arc<dyn Tag>>,
        max_stack_size: u16,
    ) -> ParseResult<Self> {
        let code = Self::new(bytecode, constants, nodes, max_stack_size);
        code.validate()?;
        Ok(code)
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<dyn Tag>] {
        &self.nodes
    }

    #[must_use]
    pub fn max_stack_size(&self) -> u16 {
        self.max_stack_size
    }

    pub(crate) fn constant(&self, index: u16) -> &Constant {
        &self.constants[usize::from(index)]
    }

    pub(crate) fn node(&self, index: u16) -> &Arc<dyn Tag> {
        &self.nodes[usize::from(index)]
    }

    /// Iterates `(offset, opcode)` over the instruction stream.
    ///
    /// Stops at the first malformed instruction.
    pub fn instructions(&self) -> impl Iterator<Item = (usize, Opcode)> + '_ {
        let mut ip = 0;
        std::iter::from_fn(move || {
            let opcode = Opcode::try_from(*self.bytecode.get(ip)?).ok()?;
            let offset = ip;
            ip += instruction_len(&self.bytecode, ip)?;
            Some((offset, opcode))
        })
    }

    /// Checks operand bounds, pool and node indices and stack discipline.
    ///
    /// Every check the VM would otherwise have to make per instruction is made
    /// here once, so a validated program never reads out of bounds or pops an
    /// empty stack.
    pub fn validate(&self) -> ParseResult<()> {
        let invalid = |ip: usize, what: &str| LiquidError::serialization(format!("invalid bytecode at 0x{ip:04x}: {what}"));
        let bytes = &self.bytecode;
        let mut ip = 0;
        let mut depth: i32 = 0;
        let mut in_rescue = false;
        let mut terminated = false;
        while ip < bytes.len() {
            let opcode = Opcode::try_from(bytes[ip]).map_err(|err| invalid(ip, &err.to_string()))?;
            let len = instruction_len(bytes, ip).ok_or_else(|| invalid(ip, "truncated instruction"))?;
            let operands = &bytes[ip + 1..ip + len];
            let u16_operand = || u16::from_le_bytes([operands[0], operands[1]]);
            let effect = match opcode {
                Opcode::WriteRaw | Opcode::WriteRawW => {
                    let width = opcode.operand_width();
                    if std::str::from_utf8(&operands[width..]).is_err() {
                        return Err(invalid(ip, "raw text is not UTF-8"));
                    }
                    0
                }
                Opcode::WriteNode => {
                    if usize::from(u16_operand()) >= self.nodes.len() {
                        return Err(invalid(ip, "node index out of range"));
                    }
                    0
                }
                Opcode::PushConst => {
                    if usize::from(u16_operand()) >= self.constants.len() {
                        return Err(invalid(ip, "constant index out of range"));
                    }
                    1
                }
                Opcode::FindStaticVar | Opcode::LookupCommand | Opcode::Filter => {
                    let name = self.constants.get(usize::from(u16_operand()));
                    if name.and_then(Constant::as_str).is_none() {
                        return Err(invalid(ip, "expected a string constant"));
                    }
                    if opcode == Opcode::Filter {
                        filter_effect(operands[2])
                    } else {
                        i32::from(opcode == Opcode::FindStaticVar)
                    }
                }
                Opcode::LookupConstKey => {
                    if usize::from(u16_operand()) >= self.constants.len() {
                        return Err(invalid(ip, "constant index out of range"));
                    }
                    0
                }
                Opcode::HashNew => 1 - 2 * i32::from(operands[0]),
                Opcode::BuiltinFilter => {
                    if BuiltinFilter::from_repr(operands[0]).is_none() {
                        return Err(invalid(ip, "unknown built-in filter"));
                    }
                    filter_effect(operands[1])
                }
                Opcode::RenderVariableRescue => {
                    if in_rescue {
                        return Err(invalid(ip, "nested rescue region"));
                    }
                    in_rescue = true;
                    0
                }
                Opcode::PopWrite => {
                    in_rescue = false;
                    -1
                }
                Opcode::Leave => 0,
                other => i32::from(other.stack_effect().unwrap_or(0)),
            };
            let pops = stack_pops(opcode, operands);
            // a filter always receives at least its input
            let missing_input = pops == 0 && matches!(opcode, Opcode::Filter | Opcode::BuiltinFilter);
            if depth < pops || missing_input {
                return Err(invalid(ip, "stack underflow"));
            }
            depth += effect;
            if depth > i32::from(self.max_stack_size) {
                return Err(invalid(ip, "stack exceeds max_stack_size"));
            }
            ip += len;
            if opcode == Opcode::Leave {
                terminated = true;
                break;
            }
        }
        if !terminated || ip != bytes.len() || in_rescue {
            return Err(invalid(ip, "program must end with leave"));
        }
        Ok(())
    }
}

/// Operand stack values consumed by the instruction.
fn stack_pops(opcode: Opcode, operands: &[u8]) -> i32 {
    match opcode {
        Opcode::PopWrite | Opcode::FindVar | Opcode::LookupConstKey | Opcode::LookupCommand => 1,
        Opcode::LookupKey | Opcode::NewIntRange => 2,
        Opcode::HashNew => 2 * i32::from(operands[0]),
        Opcode::Filter | Opcode::BuiltinFilter => {
            let (argc, _) = decode_argc(operands[operands.len() - 1]);
            i32::try_from(argc).unwrap_or(i32::MAX)
        }
        _ => 0,
    }
}

fn filter_effect(argc: u8) -> i32 {
    let (argc, _) = decode_argc(argc);
    1 - i32::try_from(argc).unwrap_or(i32::MAX)
}

/// Total length of the instruction at `ip`, or `None` if it is truncated.
pub(crate) fn instruction_len(bytecode: &[u8], ip: usize) -> Option<usize> {
    let opcode = Opcode::try_from(*bytecode.get(ip)?).ok()?;
    let width = opcode.operand_width();
    let operands = bytecode.get(ip + 1..ip + 1 + width)?;
    let text_len = match opcode {
        Opcode::WriteRaw => usize::from(operands[0]),
        Opcode::WriteRawW => usize::try_from(read_u24(operands)).ok()?,
        _ => 0,
    };
    let len = 1 + width + text_len;
    (ip + len <= bytecode.len()).then_some(len)
}
