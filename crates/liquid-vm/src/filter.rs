//! Filter registry and the callable interface filters implement.
//!
//! Filters are looked up by name at render time. Filters registered as one
//! of the [`BuiltinFilter`] names additionally get a fixed slot, which lets
//! the compiler emit `builtin_filter` with a one-byte id instead of a name
//! constant. Both paths call the same [`Filter`], so the choice is purely a
//! dispatch optimization.

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use strum::EnumCount;

use crate::{
    context::Context,
    error::{LiquidError, RenderResult},
    value::{Map, Value},
};

/// Accepted argument counts, counting the input, positionals and the keyword map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    #[must_use]
    pub const fn exactly(n: usize) -> Self {
        Self { min: n, max: Some(n) }
    }

    #[must_use]
    pub const fn range(min: usize, max: usize) -> Self {
        Self { min, max: Some(max) }
    }

    #[must_use]
    pub const fn at_least(min: usize) -> Self {
        Self { min, max: None }
    }

    #[must_use]
    pub fn accepts(self, given: usize) -> bool {
        given >= self.min && self.max.is_none_or(|max| given <= max)
    }

    /// Error for a call with `given` arguments.
    #[must_use]
    pub fn error(self, given: usize) -> LiquidError {
        LiquidError::argument(format!("wrong number of arguments (given {given}, expected {self})"))
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{max}"),
            Some(max) => write!(f, "{}..{max}", self.min),
            None => write!(f, "{}+", self.min),
        }
    }
}

/// A filter callable.
pub trait Filter: Send + Sync {
    fn arity(&self) -> Arity;

    /// Applies the filter to `input`.
    ///
    /// The arity has already been checked; `keywords` is `None` when the call
    /// site passed no keyword arguments.
    fn call(&self, input: Value, args: &[Value], keywords: Option<&Map>, context: &Context<'_>) -> RenderResult<Value>;
}

/// Adapts a closure into a [`Filter`].
pub struct FilterFn<F> {
    arity: Arity,
    f: F,
}

impl<F> Filter for FilterFn<F>
where
    F: Fn(Value, &[Value], Option<&Map>, &Context<'_>) -> RenderResult<Value> + Send + Sync,
{
    fn arity(&self) -> Arity {
        self.arity
    }

    fn call(&self, input: Value, args: &[Value], keywords: Option<&Map>, context: &Context<'_>) -> RenderResult<Value> {
        (self.f)(input, args, keywords, context)
    }
}

/// Wraps a closure as a filter with the given arity.
pub fn filter_fn<F>(arity: Arity, f: F) -> FilterFn<F>
where
    F: Fn(Value, &[Value], Option<&Map>, &Context<'_>) -> RenderResult<Value> + Send + Sync,
{
    FilterFn { arity, f }
}

/// Filters with a fixed dispatch slot.
///
/// The discriminant is the `builtin_filter` operand, so variants may only be
/// appended.
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::FromRepr,
    strum::EnumString,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumIter,
    strum::EnumCount,
)]
#[strum(serialize_all = "snake_case")]
pub enum BuiltinFilter {
    Default,
    Upcase,
    Downcase,
    Capitalize,
    Append,
    Prepend,
    Plus,
    Minus,
    Times,
    Size,
    First,
    Last,
    Join,
    Split,
    Concat,
    Slice,
    Map,
    Strip,
}

/// Name-to-filter table plus the built-in slot table.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: AHashMap<String, Arc<dyn Filter>>,
    builtins: [Option<Arc<dyn Filter>>; BuiltinFilter::COUNT],
}

impl FilterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `filter` under `name`, replacing any previous filter.
    ///
    /// Registering over a built-in name takes that name off the fast path.
    pub fn register(&mut self, name: impl Into<String>, filter: impl Filter + 'static) {
        let name = name.into();
        if let Ok(builtin) = name.parse::<BuiltinFilter>() {
            self.builtins[builtin as usize] = None;
        }
        self.filters.insert(name, Arc::new(filter));
    }

    /// Registers a filter under a built-in name with a fixed slot.
    pub fn register_builtin(&mut self, builtin: BuiltinFilter, filter: impl Filter + 'static) {
        let filter: Arc<dyn Filter> = Arc::new(filter);
        self.builtins[builtin as usize] = Some(Arc::clone(&filter));
        self.filters.insert(builtin.to_string(), filter);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Filter>> {
        self.filters.get(name)
    }

    #[must_use]
    pub fn builtin(&self, builtin: BuiltinFilter) -> Option<&Arc<dyn Filter>> {
        self.builtins[builtin as usize].as_ref()
    }

    /// The fixed slot for `name`, if it is a built-in name still on the fast path.
    #[must_use]
    pub fn builtin_id(&self, name: &str) -> Option<BuiltinFilter> {
        let builtin = name.parse::<BuiltinFilter>().ok()?;
        self.builtins[builtin as usize].is_some().then_some(builtin)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.filters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry").field("filters", &self.names()).finish()
    }
}
