//! Render-time state: scopes, environments, filters, error policy and limits.
//!
//! A [`Context`] lives for one render. Compiled templates are shared and
//! immutable; everything a render mutates (assigned variables, counters,
//! collected errors, resource counters) lives here.

use std::fmt;

use ahash::AHashMap;

use crate::{
    bytecode,
    error::{LiquidError, RenderResult},
    expression::{Expression, Variable, VariableLookup},
    filter::{BuiltinFilter, Filter, FilterRegistry},
    parse_context::ErrorMode,
    resource::{LimitsConfig, ResourceLimits},
    tracer::VmTracer,
    value::{Map, Value},
};

/// Deepest scope nesting a render may reach.
pub const MAX_SCOPE_DEPTH: usize = 100;

/// Pending loop control raised by `break` or `continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Interrupt {
    Break,
    Continue,
}

/// Replaces the default inline error text for recovered errors.
///
/// Returning `Err` aborts the render with that error.
pub type ExceptionRenderer<'a> = Box<dyn FnMut(&LiquidError) -> RenderResult<String> + 'a>;

/// Evaluation state for a single render.
pub struct Context<'a> {
    /// Local scopes; index 0 is the outermost scope that `assign` writes to.
    scopes: Vec<Map>,
    /// Read-only data searched after the scopes. Index 0 holds the render's
    /// assigns and the `increment` counters.
    environments: Vec<Map>,
    filters: &'a FilterRegistry,
    strict_variables: bool,
    strict_filters: bool,
    /// Set while a filter is being applied.
    filtering: bool,
    /// Attach line numbers to recovered errors.
    line_numbers: bool,
    error_mode: ErrorMode,
    rethrow_errors: bool,
    exception_renderer: Option<ExceptionRenderer<'a>>,
    errors: Vec<LiquidError>,
    interrupts: Vec<Interrupt>,
    /// Per-render state owned by tags, such as `for` loop offsets.
    registers: AHashMap<String, Value>,
    resource_limits: ResourceLimits,
    tracer: Option<&'a mut dyn VmTracer>,
}

impl<'a> Context<'a> {
    #[must_use]
    pub fn new(filters: &'a FilterRegistry) -> Self {
        Self {
            scopes: vec![Map::new()],
            environments: vec![Map::new()],
            filters,
            strict_variables: false,
            strict_filters: false,
            filtering: false,
            line_numbers: false,
            error_mode: ErrorMode::default(),
            rethrow_errors: false,
            exception_renderer: None,
            errors: Vec::new(),
            interrupts: Vec::new(),
            registers: AHashMap::new(),
            resource_limits: ResourceLimits::default(),
            tracer: None,
        }
    }

    /// Sets the render's assigns, the first environment.
    #[must_use]
    pub fn with_assigns(mut self, assigns: Map) -> Self {
        self.environments[0] = assigns;
        self
    }

    /// Appends a read-only environment searched after the assigns.
    #[must_use]
    pub fn with_static_environment(mut self, environment: Map) -> Self {
        self.environments.push(environment);
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.resource_limits = ResourceLimits::new(limits);
        self
    }

    pub fn set_strict_variables(&mut self, strict: bool) {
        self.strict_variables = strict;
    }

    pub fn set_strict_filters(&mut self, strict: bool) {
        self.strict_filters = strict;
    }

    pub fn set_line_numbers(&mut self, line_numbers: bool) {
        self.line_numbers = line_numbers;
    }

    pub fn set_error_mode(&mut self, error_mode: ErrorMode) {
        self.error_mode = error_mode;
    }

    pub fn set_rethrow_errors(&mut self, rethrow: bool) {
        self.rethrow_errors = rethrow;
    }

    pub fn set_exception_renderer(&mut self, renderer: impl FnMut(&LiquidError) -> RenderResult<String> + 'a) {
        self.exception_renderer = Some(Box::new(renderer));
    }

    pub fn set_tracer(&mut self, tracer: &'a mut dyn VmTracer) {
        self.tracer = Some(tracer);
    }

    #[must_use]
    pub fn strict_variables(&self) -> bool {
        self.strict_variables
    }

    #[must_use]
    pub fn strict_filters(&self) -> bool {
        self.strict_filters
    }

    /// Whether a filter is currently being applied.
    #[must_use]
    pub fn filtering(&self) -> bool {
        self.filtering
    }

    #[must_use]
    pub fn filters(&self) -> &'a FilterRegistry {
        self.filters
    }

    /// Errors recovered during the render, in order.
    #[must_use]
    pub fn errors(&self) -> &[LiquidError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<LiquidError> {
        std::mem::take(&mut self.errors)
    }

    #[must_use]
    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.resource_limits
    }

    pub fn resource_limits_mut(&mut self) -> &mut ResourceLimits {
        &mut self.resource_limits
    }

    pub(crate) fn tracer(&mut self) -> Option<&mut (dyn VmTracer + 'a)> {
        self.tracer.as_deref_mut()
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    /// Pushes a new innermost scope.
    pub fn push_scope(&mut self, scope: Map) -> RenderResult<()> {
        if self.scopes.len() > MAX_SCOPE_DEPTH {
            return Err(LiquidError::standard("Nesting too deep"));
        }
        self.scopes.push(scope);
        Ok(())
    }

    /// Pops the innermost scope. The outermost scope is never removed.
    pub fn pop_scope(&mut self) -> Option<Map> {
        if self.scopes.len() > 1 { self.scopes.pop() } else { None }
    }

    /// Runs `f` inside a new innermost scope, popping it even when `f` fails.
    pub fn with_scope<T>(&mut self, scope: Map, f: impl FnOnce(&mut Self) -> RenderResult<T>) -> RenderResult<T> {
        self.push_scope(scope)?;
        let result = f(self);
        self.pop_scope();
        result
    }

    /// Sets `name` in the innermost scope.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    /// Sets `name` in the outermost scope, charging the value to the assign score.
    pub fn assign(&mut self, name: impl Into<String>, value: Value) -> RenderResult<()> {
        self.resource_limits.increment_assign_score(value.retained_size())?;
        self.set_global(name, value);
        Ok(())
    }

    /// Sets `name` in the outermost scope without scoring it.
    ///
    /// `capture` uses this; its output was already charged while rendering.
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.scopes[0].insert(name.into(), value);
    }

    /// Runs `f` with output growth charged to the assign score.
    pub fn with_capture<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let previous = self.resource_limits.begin_capture();
        let result = f(self);
        self.resource_limits.end_capture(previous);
        result
    }

    /// Returns the current value of an `increment` counter and advances it.
    pub fn increment_counter(&mut self, name: &str) -> Value {
        let counter = self.environments[0].entry(name.to_owned()).or_insert(Value::Int(0));
        let current = counter.as_int().unwrap_or(0);
        *counter = Value::Int(current.saturating_add(1));
        Value::Int(current)
    }

    #[must_use]
    pub fn register(&self, key: &str) -> Option<&Value> {
        self.registers.get(key)
    }

    pub fn set_register(&mut self, key: impl Into<String>, value: Value) {
        self.registers.insert(key.into(), value);
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    pub fn push_interrupt(&mut self, interrupt: Interrupt) {
        self.interrupts.push(interrupt);
    }

    pub fn pop_interrupt(&mut self) -> Option<Interrupt> {
        self.interrupts.pop()
    }

    #[must_use]
    pub fn has_interrupt(&self) -> bool {
        !self.interrupts.is_empty()
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Finds a variable by name, searching scopes innermost first, then the environments.
    ///
    /// A miss yields nil, or `UndefinedVariable` when `raise_on_not_found`
    /// is set and the context is strict about variables.
    pub fn find_variable(&self, name: &str, raise_on_not_found: bool) -> RenderResult<Value> {
        let found = self
            .scopes
            .iter()
            .rev()
            .chain(self.environments.iter())
            .find_map(|scope| scope.get(name));
        match found {
            Some(value) => Ok(value.clone()),
            None if raise_on_not_found && self.strict_variables => Err(LiquidError::undefined_variable(name)),
            None => Ok(Value::Nil),
        }
    }

    /// Finds a variable whose name was computed, as in `[expr]` roots.
    pub fn find_dynamic_variable(&self, key: &Value) -> RenderResult<Value> {
        match key.to_liquid() {
            Value::Str(name) => self.find_variable(&name, true),
            other => self.find_variable(&other.to_string(), true),
        }
    }

    /// Resolves `receiver[key]` and non-command `receiver.key` segments.
    pub fn lookup_key(&self, receiver: &Value, key: &Value) -> RenderResult<Value> {
        let key = key.to_liquid();
        let found = match receiver {
            Value::Drop(drop) => drop.resolve_key(&key, self)?,
            other => other.index(&key),
        };
        match found {
            Some(value) => Ok(value),
            // integer indexing past the end of a sequence is nil, never an error
            None if matches!((receiver, &key), (Value::Array(_) | Value::Range(..), Value::Int(_))) => Ok(Value::Nil),
            None => self.miss(&key),
        }
    }

    /// Resolves a command segment such as `.size`, `.first` or `.last`.
    ///
    /// A hash that has the command name as a key returns that entry.
    pub fn lookup_command(&self, receiver: &Value, name: &str) -> RenderResult<Value> {
        let found = match receiver {
            Value::Drop(drop) => drop.resolve_command(name, self)?,
            Value::Map(map) if map.contains_key(name) => map.get(name).cloned(),
            other => other.builtin_command(name),
        };
        match found {
            Some(value) => Ok(value),
            None => self.miss(&Value::from(name)),
        }
    }

    fn miss(&self, key: &Value) -> RenderResult<Value> {
        if self.strict_variables {
            Err(LiquidError::undefined_variable(&key.to_string()))
        } else {
            Ok(Value::Nil)
        }
    }

    /// Converts a range bound the way `(a..b)` does.
    ///
    /// Nil is 0 and strings parse their leading integer; floats and other
    /// values are rejected.
    pub fn range_bound(value: &Value) -> RenderResult<i64> {
        match value.to_liquid() {
            Value::Int(i) => Ok(i),
            Value::Nil => Ok(0),
            Value::Str(s) => Ok(leading_int(&s)),
            _ => Err(LiquidError::argument("invalid integer")),
        }
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluates a parsed expression.
    pub fn evaluate(&mut self, expression: &Expression) -> RenderResult<Value> {
        match expression {
            Expression::Nil => Ok(Value::Nil),
            Expression::Bool(b) => Ok(Value::Bool(*b)),
            Expression::Int(i) => Ok(i.to_value()),
            Expression::Float(f) => Ok(Value::Float(*f)),
            Expression::String(s) => Ok(Value::Str(s.clone())),
            Expression::Range(start, end) => {
                let start = self.evaluate(start)?;
                let end = self.evaluate(end)?;
                Ok(Value::Range(Self::range_bound(&start)?, Self::range_bound(&end)?))
            }
            Expression::Lookup(lookup) => self.evaluate_lookup(lookup),
            Expression::Compiled(compiled) => bytecode::evaluate(compiled.code(), self),
        }
    }

    fn evaluate_lookup(&mut self, lookup: &VariableLookup) -> RenderResult<Value> {
        let mut value = match &lookup.name {
            Expression::String(name) => self.find_variable(name, true)?,
            name => {
                let key = self.evaluate(name)?;
                self.find_dynamic_variable(&key)?
            }
        };
        for segment in &lookup.lookups {
            value = match &segment.key {
                Expression::String(name) if segment.command => self.lookup_command(&value, name)?,
                key => {
                    let key = self.evaluate(key)?;
                    self.lookup_key(&value, &key)?
                }
            };
        }
        Ok(value)
    }

    /// Evaluates a variable and applies its filter pipeline.
    pub fn evaluate_variable(&mut self, variable: &Variable) -> RenderResult<Value> {
        let mut value = self.evaluate(&variable.expression)?;
        for filter in &variable.filters {
            let args = filter
                .args
                .iter()
                .map(|arg| self.evaluate(arg))
                .collect::<RenderResult<Vec<_>>>()?;
            let keywords = if filter.keyword_args.is_empty() {
                None
            } else {
                let mut keywords = Map::with_capacity(filter.keyword_args.len());
                for (key, arg) in &filter.keyword_args {
                    let value = self.evaluate(arg)?;
                    keywords.insert(key.clone(), value);
                }
                Some(keywords)
            };
            value = self.apply_filter(&filter.name, value, &args, keywords.as_ref())?;
        }
        Ok(value)
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// Applies the filter registered as `name`.
    ///
    /// Unknown filters return their input unchanged unless the context is
    /// strict about filters.
    pub fn apply_filter(&mut self, name: &str, input: Value, args: &[Value], keywords: Option<&Map>) -> RenderResult<Value> {
        let filters = self.filters;
        match filters.get(name) {
            Some(filter) => self.invoke_filter(name, filter.as_ref(), input, args, keywords),
            None if self.strict_filters => Err(LiquidError::undefined_filter(name)),
            None => Ok(input),
        }
    }

    /// Applies a filter through its built-in slot.
    pub fn apply_builtin_filter(
        &mut self,
        builtin: BuiltinFilter,
        input: Value,
        args: &[Value],
        keywords: Option<&Map>,
    ) -> RenderResult<Value> {
        let filters = self.filters;
        match filters.builtin(builtin) {
            Some(filter) => self.invoke_filter(builtin.into(), filter.as_ref(), input, args, keywords),
            None => self.apply_filter(builtin.into(), input, args, keywords),
        }
    }

    fn invoke_filter(
        &mut self,
        name: &str,
        filter: &dyn Filter,
        input: Value,
        args: &[Value],
        keywords: Option<&Map>,
    ) -> RenderResult<Value> {
        let given = 1 + args.len() + usize::from(keywords.is_some());
        if let Some(tracer) = self.tracer() {
            tracer.on_filter(name, given);
        }
        let arity = filter.arity();
        if !arity.accepts(given) {
            return Err(arity.error(given));
        }
        let previous = std::mem::replace(&mut self.filtering, true);
        let result = filter.call(input, args, keywords, self);
        self.filtering = previous;
        result
    }

    // ========================================================================
    // Output and errors
    // ========================================================================

    /// Writes `value` as template output.
    ///
    /// Drops render through their own hook, arrays concatenate their items.
    pub fn write_value(&self, value: &Value, output: &mut String) -> RenderResult<()> {
        match value {
            Value::Drop(drop) => output.push_str(&drop.render_text(self)?),
            Value::Array(items) => {
                for item in items.iter() {
                    self.write_value(item, output)?;
                }
            }
            other => other.write_plain(output),
        }
        Ok(())
    }

    /// Routes a render error through the error policy.
    ///
    /// Fatal errors, and every error when rethrowing or in strict mode, are
    /// returned as `Err`. Otherwise the error is recorded and the text to
    /// write in its place is returned.
    pub fn handle_error(&mut self, error: LiquidError, line_number: Option<u32>) -> RenderResult<String> {
        if error.is_fatal() {
            return Err(error);
        }
        let error = if self.line_numbers {
            error.with_line_number(line_number)
        } else {
            error
        };
        let rethrow = self.rethrow_errors || self.error_mode == ErrorMode::Strict;
        if let Some(tracer) = self.tracer() {
            tracer.on_error(&error, !rethrow);
        }
        if rethrow {
            return Err(error);
        }
        self.errors.push(error.clone());
        match self.exception_renderer.as_mut() {
            Some(renderer) => renderer(&error),
            None => Ok(error.to_string()),
        }
    }

    /// Ends a render aborted by a fatal error.
    ///
    /// When rethrowing the error is returned; otherwise it is recorded and
    /// its text becomes the whole output.
    pub fn recover_fatal(&mut self, error: LiquidError) -> RenderResult<String> {
        let rethrow = self.rethrow_errors;
        if let Some(tracer) = self.tracer() {
            tracer.on_error(&error, !rethrow);
        }
        if rethrow {
            return Err(error);
        }
        let text = error.to_string();
        self.errors.push(error);
        Ok(text)
    }

    pub fn increment_render_score(&mut self, amount: usize) -> RenderResult<()> {
        self.resource_limits.increment_render_score(amount).map_err(Into::into)
    }

    pub fn increment_write_score(&mut self, output_len: usize) -> RenderResult<()> {
        self.resource_limits.increment_write_score(output_len).map_err(Into::into)
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("scopes", &self.scopes)
            .field("strict_variables", &self.strict_variables)
            .field("strict_filters", &self.strict_filters)
            .field("error_mode", &self.error_mode)
            .field("errors", &self.errors)
            .field("interrupts", &self.interrupts)
            .field("resource_limits", &self.resource_limits)
            .finish_non_exhaustive()
    }
}

/// Integer prefix of a string: optional sign, then digits, after leading whitespace.
///
/// No digits parses as 0; values past the `i64` range saturate.
pub(crate) fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        let digit = i64::from(b - b'0');
        value = value.saturating_mul(10).saturating_add(digit);
    }
    if negative { -value } else { value }
}
