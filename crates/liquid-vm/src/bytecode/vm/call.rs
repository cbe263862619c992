//! Filter invocation from the operand stack.

use smallvec::SmallVec;

use super::Vm;
use crate::{
    bytecode::op::decode_argc,
    context::Context,
    error::RenderResult,
    filter::BuiltinFilter,
    value::Value,
};

/// How the called filter was named in the program.
pub(super) enum FilterTarget<'c> {
    /// Looked up by name in the registry (`filter`).
    Named(&'c str),
    /// Dispatched through the built-in slot table (`builtin_filter`).
    Builtin(BuiltinFilter),
}

impl Vm<'_> {
    /// Pops the input, positional arguments and optional keyword map, applies
    /// the filter and pushes its result.
    ///
    /// Stack layout before the call, bottom to top:
    /// `input, arg1, ..., argN[, keywords]`.
    pub(super) fn call_filter(
        &mut self,
        context: &mut Context<'_>,
        target: FilterTarget<'_>,
        argc: u8,
    ) -> RenderResult<()> {
        let (argc, has_keywords) = decode_argc(argc);
        let keywords = if has_keywords {
            match self.pop() {
                Value::Map(map) => Some(map),
                _ => None,
            }
        } else {
            None
        };
        let positional = argc.saturating_sub(1 + usize::from(has_keywords));
        let start = self.stack.len().saturating_sub(positional);
        let args: SmallVec<[Value; 4]> = self.stack.drain(start..).collect();
        let input = self.pop();

        let result = match target {
            FilterTarget::Named(name) => context.apply_filter(name, input, &args, keywords.as_deref())?,
            FilterTarget::Builtin(builtin) => context.apply_builtin_filter(builtin, input, &args, keywords.as_deref())?,
        };
        self.push(result);
        Ok(())
    }
}
