//! Bytecode compiler and virtual machine for template bodies and expressions.
//!
//! Block bodies and standalone expressions are lowered to a compact byte
//! program that a stack VM evaluates against a [`Context`](crate::Context).
//! Control flow stays inside tags; the instruction set only expresses
//! "evaluate an expression, apply a filter pipeline, write text".
//!
//! # Module Structure
//!
//! - `op` - Opcode enum definitions and operand encodings
//! - `code` - Immutable program: bytecode, constant pool, node table
//! - `builder` - CodeBuilder for emitting bytecode with stack tracking
//! - `compiler` - Expression, variable and tag lowering
//! - `disassemble` - Human-readable program listings
//! - `vm` - Stack interpreter with guarded render regions

pub use builder::CodeBuilder;
pub use code::{Code, ConstPool, Constant};
pub use compiler::Compiler;
pub use op::{InvalidOpcodeError, KEYWORD_ARGS_FLAG, Opcode, decode_argc};
pub use vm::{evaluate, render};

mod builder;
mod code;
mod compiler;
mod disassemble;
mod op;
mod vm;
