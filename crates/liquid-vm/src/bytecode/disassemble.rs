//! Human-readable listing of compiled programs.
//!
//! One line per instruction: `0x0000: name(operands)`.

use std::fmt::Write;

use super::{
    code::{Code, Constant},
    op::{Opcode, decode_argc, read_u24},
};
use crate::{filter::BuiltinFilter, value::write_float};

impl Code {
    /// Lists the program, one instruction per line.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let bytes = self.bytecode();
        for (ip, opcode) in self.instructions() {
            let operands = &bytes[ip + 1..];
            let u16_at = |i: usize| u16::from_le_bytes([operands[i], operands[i + 1]]);
            let _ = write!(out, "0x{ip:04x}: {opcode}");
            match opcode {
                Opcode::WriteRaw => {
                    let len = usize::from(operands[0]);
                    write_text(&mut out, &operands[1..=len]);
                }
                Opcode::WriteRawW => {
                    let len = usize::try_from(read_u24(operands)).unwrap_or(0);
                    write_text(&mut out, &operands[3..3 + len]);
                }
                Opcode::WriteNode => {
                    let node = self.node(u16_at(0));
                    let markup = &node.markup().markup;
                    if markup.is_empty() {
                        let _ = write!(out, "({{% {} %}})", node.name());
                    } else {
                        let _ = write!(out, "({{% {} {markup} %}})", node.name());
                    }
                }
                Opcode::PushInt8 => {
                    let _ = write!(out, "({})", i8::from_ne_bytes([operands[0]]));
                }
                Opcode::PushInt16 => {
                    let _ = write!(out, "({})", i16::from_le_bytes([operands[0], operands[1]]));
                }
                Opcode::PushConst | Opcode::FindStaticVar | Opcode::LookupConstKey | Opcode::LookupCommand => {
                    out.push('(');
                    write_constant(&mut out, self.constant(u16_at(0)));
                    out.push(')');
                }
                Opcode::HashNew => {
                    let _ = write!(out, "({})", operands[0]);
                }
                Opcode::Filter => {
                    let name = self.constant(u16_at(0)).as_str().unwrap_or_default();
                    let (argc, _) = decode_argc(operands[2]);
                    let _ = write!(out, "(name: :{name}, num_args: {argc})");
                }
                Opcode::BuiltinFilter => {
                    let name = BuiltinFilter::from_repr(operands[0]).map_or("?", <&str>::from);
                    let (argc, _) = decode_argc(operands[1]);
                    let _ = write!(out, "(name: :{name}, num_args: {argc})");
                }
                Opcode::RenderVariableRescue => {
                    let _ = write!(out, "(line_number: {})", read_u24(operands));
                }
                Opcode::Leave
                | Opcode::PopWrite
                | Opcode::PushNil
                | Opcode::PushTrue
                | Opcode::PushFalse
                | Opcode::FindVar
                | Opcode::LookupKey
                | Opcode::NewIntRange => {}
            }
            out.push('\n');
        }
        out
    }
}

fn write_text(out: &mut String, bytes: &[u8]) {
    let _ = write!(out, "({:?})", String::from_utf8_lossy(bytes));
}

fn write_constant(out: &mut String, constant: &Constant) {
    match constant {
        Constant::Str(s) => {
            let _ = write!(out, "{:?}", &**s);
        }
        Constant::Empty => out.push_str("\"\""),
        Constant::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Constant::BigInt(i) => {
            let _ = write!(out, "{i}");
        }
        Constant::Float(f) => write_float(out, *f),
        Constant::Range(start, end) => {
            let _ = write!(out, "{start}..{end}");
        }
    }
}
