//! Runtime values and the dynamic-object ("drop") protocol.
//!
//! Every payload that can be large is reference counted, so pushing a value
//! on the VM stack, storing it in a scope or returning it from a lookup never
//! deep-copies. Compiled templates and contexts share strings and containers
//! through these handles; nothing here is mutated after construction.

use std::{
    cmp::Ordering,
    fmt::{self, Write},
    sync::{Arc, LazyLock},
};

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::{
    context::Context,
    error::{LiquidError, RenderResult},
};

/// Insertion-ordered string-keyed mapping used for hashes and scopes.
pub type Map = IndexMap<String, Value>;

/// The shared empty string that both `empty` and `blank` literals evaluate to.
///
/// Comparisons recognise this exact allocation and apply emptiness semantics
/// (`[] == empty` is true) instead of plain string equality.
static EMPTY_LITERAL: LazyLock<Arc<str>> = LazyLock::new(|| Arc::from(""));

/// Command names that a `.name` lookup dispatches as a capability call.
pub const COMMAND_NAMES: [&str; 3] = ["size", "first", "last"];

/// A host value implementing the dynamic-object protocol.
///
/// Both lookups are optional: the defaults report a miss for keys and route
/// commands through [`LiquidDrop::to_liquid_value`] (when the drop exposes a
/// plain value) before falling back to a key probe.
pub trait LiquidDrop: fmt::Debug + Send + Sync {
    /// Resolves `drop[key]` and `drop.key` for non-command keys.
    ///
    /// `Ok(None)` is a miss and follows the context's strict/lenient policy.
    fn resolve_key(&self, _key: &Value, _context: &Context<'_>) -> RenderResult<Option<Value>> {
        Ok(None)
    }

    /// Resolves a command segment such as `drop.size`.
    fn resolve_command(&self, name: &str, context: &Context<'_>) -> RenderResult<Option<Value>> {
        if let Some(value) = self.to_liquid_value()
            && let Some(result) = value.builtin_command(name)
        {
            return Ok(Some(result));
        }
        self.resolve_key(&Value::from(name), context)
    }

    /// Plain value this drop stands for when used as a key, compared or rendered.
    fn to_liquid_value(&self) -> Option<Value> {
        None
    }

    /// Text written when the drop itself is output.
    fn render_text(&self, _context: &Context<'_>) -> RenderResult<String> {
        match self.to_liquid_value() {
            Some(value) => Ok(value.to_string()),
            None => Err(LiquidError::type_error(format!(
                "{} can't be converted to a string",
                self.type_name()
            ))),
        }
    }

    /// Name used in error messages.
    fn type_name(&self) -> &'static str {
        "Drop"
    }
}

/// A Liquid runtime value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    BigInt(Arc<BigInt>),
    Float(f64),
    Str(Arc<str>),
    Array(Arc<Vec<Value>>),
    Map(Arc<Map>),
    /// Inclusive integer range `(start..end)`.
    Range(i64, i64),
    Drop(Arc<dyn LiquidDrop>),
}

impl Value {
    /// The value of the `empty`/`blank` literals.
    #[must_use]
    pub fn empty_literal() -> Self {
        Self::Str(Arc::clone(&EMPTY_LITERAL))
    }

    pub(crate) fn empty_literal_str() -> Arc<str> {
        Arc::clone(&EMPTY_LITERAL)
    }

    /// Whether this is the shared `empty`/`blank` singleton rather than a literal `''`.
    #[must_use]
    pub fn is_empty_literal(&self) -> bool {
        matches!(self, Self::Str(s) if Arc::ptr_eq(s, &EMPTY_LITERAL))
    }

    pub(crate) fn is_empty_literal_str(s: &Arc<str>) -> bool {
        Arc::ptr_eq(s, &EMPTY_LITERAL)
    }

    /// Creates an integer value, narrowing to the machine-width variant when it fits.
    #[must_use]
    pub fn from_bigint(value: BigInt) -> Self {
        match value.to_i64() {
            Some(small) => Self::Int(small),
            None => Self::BigInt(Arc::new(value)),
        }
    }

    #[must_use]
    pub fn array(items: Vec<Self>) -> Self {
        Self::Array(Arc::new(items))
    }

    #[must_use]
    pub fn map(map: Map) -> Self {
        Self::Map(Arc::new(map))
    }

    pub fn drop(drop: impl LiquidDrop + 'static) -> Self {
        Self::Drop(Arc::new(drop))
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Liquid truthiness: only `nil` and `false` are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Resolves a drop to its plain value when it exposes one.
    #[must_use]
    pub fn to_liquid(&self) -> Self {
        match self {
            Self::Drop(drop) => drop.to_liquid_value().unwrap_or_else(|| self.clone()),
            _ => self.clone(),
        }
    }

    /// True for empty strings and collections, the semantics of `== empty`.
    #[must_use]
    pub fn is_empty_value(&self) -> bool {
        match self {
            Self::Str(s) => s.is_empty(),
            Self::Array(items) => items.is_empty(),
            Self::Map(map) => map.is_empty(),
            Self::Drop(drop) => drop.to_liquid_value().is_some_and(|v| v.is_empty_value()),
            _ => false,
        }
    }

    /// True for nil, false, whitespace-only strings and empty collections.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Nil | Self::Bool(false) => true,
            Self::Str(s) => s.trim().is_empty(),
            _ => self.is_empty_value(),
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "NilClass",
            Self::Bool(true) => "TrueClass",
            Self::Bool(false) => "FalseClass",
            Self::Int(_) | Self::BigInt(_) => "Integer",
            Self::Float(_) => "Float",
            Self::Str(_) => "String",
            Self::Array(_) => "Array",
            Self::Map(_) => "Hash",
            Self::Range(..) => "Range",
            Self::Drop(drop) => drop.type_name(),
        }
    }

    /// Built-in container behavior for `size`, `first` and `last`.
    ///
    /// Returns `None` when the receiver does not support the command.
    #[must_use]
    pub fn builtin_command(&self, name: &str) -> Option<Self> {
        match (self, name) {
            (Self::Str(s), "size") => Some(Self::Int(char_len(s))),
            (Self::Array(items), "size") => Some(Self::Int(usize_to_i64(items.len()))),
            (Self::Array(items), "first") => Some(items.first().cloned().unwrap_or_default()),
            (Self::Array(items), "last") => Some(items.last().cloned().unwrap_or_default()),
            (Self::Map(map), "size") => Some(Self::Int(usize_to_i64(map.len()))),
            (Self::Map(map), "first") => Some(map.first().map(pair_value).unwrap_or_default()),
            (Self::Range(start, end), "size") => Some(Self::Int(range_len(*start, *end))),
            (Self::Range(start, _), "first") => Some(Self::Int(*start)),
            (Self::Range(_, end), "last") => Some(Self::Int(*end)),
            (Self::Int(_), "size") => Some(Self::Int(8)),
            _ => None,
        }
    }

    /// Plain associative or index access for non-drop receivers.
    #[must_use]
    pub fn index(&self, key: &Self) -> Option<Self> {
        match (self, key) {
            (Self::Map(map), Self::Str(k)) => map.get(&**k).cloned(),
            (Self::Map(map), Self::Int(i)) => map.get(&i.to_string()).cloned(),
            (Self::Array(items), Self::Int(i)) => index_slice(items, *i).cloned(),
            (Self::Array(items), Self::Float(f)) => index_slice(items, float_to_index(*f)?).cloned(),
            (Self::Range(start, end), Self::Int(i)) => {
                let len = range_len(*start, *end);
                let idx = if *i < 0 { len + i } else { *i };
                (0..len).contains(&idx).then(|| Self::Int(start + idx))
            }
            _ => None,
        }
    }

    /// Iterates the value the way `for` loops and array filters see it.
    #[must_use]
    pub fn to_items(&self) -> Vec<Self> {
        match self {
            Self::Nil => Vec::new(),
            Self::Array(items) => items.as_ref().clone(),
            Self::Range(start, end) => (*start..=*end).map(Self::Int).collect(),
            Self::Map(map) => map.iter().map(pair_value).collect(),
            Self::Str(s) if s.is_empty() => Vec::new(),
            Self::Drop(drop) => drop.to_liquid_value().map(|v| v.to_items()).unwrap_or_else(|| vec![self.clone()]),
            other => vec![other.clone()],
        }
    }

    /// Approximate retained size charged to the assign score.
    #[must_use]
    pub fn retained_size(&self) -> usize {
        match self {
            Self::Str(s) => s.len(),
            Self::Array(items) => 1 + items.iter().map(Self::retained_size).sum::<usize>(),
            Self::Map(map) => 1 + map.iter().map(|(k, v)| k.len() + v.retained_size()).sum::<usize>(),
            _ => 1,
        }
    }

    /// Liquid equality, as used by `==` and `contains`.
    #[must_use]
    pub fn liquid_eq(&self, other: &Self) -> bool {
        if other.is_empty_literal() {
            return self.is_empty_value();
        }
        if self.is_empty_literal() {
            return other.is_empty_value();
        }
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Range(a, b), Self::Range(c, d)) => a == c && b == d,
            (Self::Array(a), Self::Array(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.liquid_eq(y)),
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.liquid_eq(w)))
            }
            (Self::Drop(a), Self::Drop(b)) if Arc::ptr_eq(a, b) => true,
            (Self::Drop(_), _) | (_, Self::Drop(_)) => {
                let (left, right) = (self.to_liquid(), other.to_liquid());
                !matches!(left, Self::Drop(_)) && !matches!(right, Self::Drop(_)) && left.liquid_eq(&right)
            }
            _ => compare_numbers(self, other) == Some(Ordering::Equal),
        }
    }

    /// Ordering for `<`, `>`, `<=` and `>=`; `None` when the values are not comparable.
    #[must_use]
    pub fn liquid_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            _ => compare_numbers(&self.to_liquid(), &other.to_liquid()),
        }
    }

    /// Converts JSON data (assigns files, host payloads) into values.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::from_bigint(BigInt::from(u))
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::from(s),
            serde_json::Value::Array(items) => Self::array(items.into_iter().map(Self::from_json).collect()),
            serde_json::Value::Object(object) => {
                Self::map(object.into_iter().map(|(k, v)| (k, Self::from_json(v))).collect())
            }
        }
    }

    pub(crate) fn write_plain(&self, out: &mut String) {
        match self {
            Self::Nil => {}
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::BigInt(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => write_float(out, *f),
            Self::Str(s) => out.push_str(s),
            Self::Array(items) => {
                for item in items.iter() {
                    item.write_plain(out);
                }
            }
            Self::Map(_) => write_inspect(out, self),
            Self::Range(start, end) => {
                let _ = write!(out, "{start}..{end}");
            }
            Self::Drop(drop) => {
                if let Some(value) = drop.to_liquid_value() {
                    value.write_plain(out);
                }
            }
        }
    }
}

/// Renders the value as template output, without drop hooks.
///
/// Use [`Context::write_value`] when the value may contain drops that render
/// themselves.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_plain(&mut out);
        f.write_str(&out)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(Arc::from(value))
    }
}

impl From<Arc<str>> for Value {
    fn from(value: Arc<str>) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<BigInt> for Value {
    fn from(value: BigInt) -> Self {
        Self::from_bigint(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::array(value)
    }
}

impl From<Map> for Value {
    fn from(value: Map) -> Self {
        Self::map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}

fn pair_value((key, value): (&String, &Value)) -> Value {
    Value::array(vec![Value::from(key.as_str()), value.clone()])
}

fn char_len(s: &str) -> i64 {
    usize_to_i64(s.chars().count())
}

pub(crate) fn usize_to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

pub(crate) fn range_len(start: i64, end: i64) -> i64 {
    if end < start { 0 } else { end.saturating_sub(start).saturating_add(1) }
}

fn index_slice(items: &[Value], index: i64) -> Option<&Value> {
    let len = usize_to_i64(items.len());
    let idx = if index < 0 { len + index } else { index };
    usize::try_from(idx).ok().and_then(|i| items.get(i))
}

#[expect(clippy::cast_possible_truncation, reason = "float indices are floored like the host language")]
fn float_to_index(f: f64) -> Option<i64> {
    f.is_finite().then(|| f.floor() as i64)
}

/// Compares two numeric values across the integer, bigint and float variants.
pub(crate) fn compare_numbers(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::BigInt(y)) => Some(BigInt::from(*x).cmp(y)),
        (Value::BigInt(x), Value::Int(y)) => Some(x.as_ref().cmp(&BigInt::from(*y))),
        (Value::BigInt(x), Value::BigInt(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Float(x), other) | (other, Value::Float(x)) => {
            let y = match other {
                Value::Int(i) => *i as f64,
                Value::BigInt(i) => i.to_f64()?,
                _ => return None,
            };
            let ordering = x.partial_cmp(&y)?;
            Some(if matches!(a, Value::Float(_)) { ordering } else { ordering.reverse() })
        }
        _ => None,
    }
}

/// Writes a float the way the host language prints it (`1.0`, `0.1`, `1.0e+20`).
pub(crate) fn write_float(out: &mut String, f: f64) {
    if f.is_nan() {
        out.push_str("NaN");
        return;
    }
    if f.is_infinite() {
        out.push_str(if f > 0.0 { "Infinity" } else { "-Infinity" });
        return;
    }
    let abs = f.abs();
    if abs.is_zero() || (1e-4..1e16).contains(&abs) {
        if f.fract().is_zero() {
            let _ = write!(out, "{f:.1}");
        } else {
            out.push_str(ryu::Buffer::new().format_finite(f));
        }
        return;
    }
    let mut buffer = ryu::Buffer::new();
    let formatted = buffer.format_finite(f);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            out.push_str(mantissa);
            if !mantissa.contains('.') {
                out.push_str(".0");
            }
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            let _ = write!(out, "e{sign}{:02}", exponent.abs());
        }
        None => out.push_str(formatted),
    }
}

fn write_inspect(out: &mut String, value: &Value) {
    match value {
        Value::Nil => out.push_str("nil"),
        Value::Str(s) => {
            let _ = write!(out, "{:?}", &**s);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_inspect(out, item);
            }
            out.push(']');
        }
        Value::Map(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{key:?}=>");
                write_inspect(out, item);
            }
            out.push('}');
        }
        other => other.write_plain(out),
    }
}
