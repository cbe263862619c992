//! The standard filters, all registered on their built-in slots.

use std::sync::LazyLock;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use regex::Regex;

use super::to_integer;
use crate::{
    context::{Context, leading_int},
    error::{LiquidError, RenderResult},
    filter::{Arity, BuiltinFilter, FilterRegistry, filter_fn},
    legacy::compile,
    value::{Map, Value, usize_to_i64},
};

static DECIMAL: LazyLock<Regex> = LazyLock::new(|| compile(r"\A-?\d+\.\d+\z"));

pub(super) fn register(filters: &mut FilterRegistry) {
    filters.register_builtin(BuiltinFilter::Default, filter_fn(Arity::range(1, 3), default));
    filters.register_builtin(
        BuiltinFilter::Upcase,
        filter_fn(Arity::exactly(1), |input, _, _, _| Ok(Value::from(input.to_string().to_uppercase()))),
    );
    filters.register_builtin(
        BuiltinFilter::Downcase,
        filter_fn(Arity::exactly(1), |input, _, _, _| Ok(Value::from(input.to_string().to_lowercase()))),
    );
    filters.register_builtin(
        BuiltinFilter::Capitalize,
        filter_fn(Arity::exactly(1), |input, _, _, _| Ok(Value::from(capitalize(&input.to_string())))),
    );
    filters.register_builtin(
        BuiltinFilter::Append,
        filter_fn(Arity::exactly(2), |input, args, _, _| {
            Ok(Value::from(format!("{input}{}", args[0])))
        }),
    );
    filters.register_builtin(
        BuiltinFilter::Prepend,
        filter_fn(Arity::exactly(2), |input, args, _, _| {
            Ok(Value::from(format!("{}{input}", args[0])))
        }),
    );
    filters.register_builtin(
        BuiltinFilter::Plus,
        filter_fn(Arity::exactly(2), |input, args, _, _| {
            Ok(arithmetic(&input, &args[0], |a, b| a + b, |a, b| a + b))
        }),
    );
    filters.register_builtin(
        BuiltinFilter::Minus,
        filter_fn(Arity::exactly(2), |input, args, _, _| {
            Ok(arithmetic(&input, &args[0], |a, b| a - b, |a, b| a - b))
        }),
    );
    filters.register_builtin(
        BuiltinFilter::Times,
        filter_fn(Arity::exactly(2), |input, args, _, _| {
            Ok(arithmetic(&input, &args[0], |a, b| a * b, |a, b| a * b))
        }),
    );
    filters.register_builtin(BuiltinFilter::Size, filter_fn(Arity::exactly(1), size));
    filters.register_builtin(
        BuiltinFilter::First,
        filter_fn(Arity::exactly(1), |input, _, _, _| {
            Ok(input.to_liquid().builtin_command("first").unwrap_or_default())
        }),
    );
    filters.register_builtin(
        BuiltinFilter::Last,
        filter_fn(Arity::exactly(1), |input, _, _, _| {
            Ok(input.to_liquid().builtin_command("last").unwrap_or_default())
        }),
    );
    filters.register_builtin(BuiltinFilter::Join, filter_fn(Arity::range(1, 2), join));
    filters.register_builtin(
        BuiltinFilter::Split,
        filter_fn(Arity::exactly(2), |input, args, _, _| {
            Ok(Value::array(
                split(&input.to_string(), &args[0].to_string())
                    .into_iter()
                    .map(Value::from)
                    .collect(),
            ))
        }),
    );
    filters.register_builtin(BuiltinFilter::Concat, filter_fn(Arity::exactly(2), concat));
    filters.register_builtin(BuiltinFilter::Slice, filter_fn(Arity::range(2, 3), slice));
    filters.register_builtin(BuiltinFilter::Map, filter_fn(Arity::exactly(2), map));
    filters.register_builtin(
        BuiltinFilter::Strip,
        filter_fn(Arity::exactly(1), |input, _, _, _| Ok(Value::from(input.to_string().trim()))),
    );
}

// ============================================================================
// Strings and defaults
// ============================================================================

fn default(input: Value, args: &[Value], keywords: Option<&Map>, _: &Context<'_>) -> RenderResult<Value> {
    let allow_false = keywords
        .and_then(|keywords| keywords.get("allow_false"))
        .is_some_and(|v| v.to_liquid().is_truthy());
    let plain = input.to_liquid();
    let missing = if allow_false { plain.is_nil() } else { !plain.is_truthy() };
    if missing || plain.is_empty_value() {
        Ok(args.first().cloned().unwrap_or_else(|| Value::from("")))
    } else {
        Ok(input)
    }
}

/// First character upper-cased, the rest lower-cased.
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

/// Splits like the host language: a single space splits on whitespace runs,
/// an empty pattern splits into characters, and trailing empty fields are dropped.
fn split<'s>(input: &'s str, pattern: &str) -> Vec<&'s str> {
    let mut parts: Vec<&str> = match pattern {
        " " => input.split_whitespace().collect(),
        "" => input.char_indices().map(|(i, c)| &input[i..i + c.len_utf8()]).collect(),
        _ => input.split(pattern).collect(),
    };
    while parts.last().is_some_and(|part| part.is_empty()) {
        parts.pop();
    }
    parts
}

// ============================================================================
// Numbers
// ============================================================================

enum Number {
    Int(BigInt),
    Float(f64),
}

/// Numeric coercion: decimal strings become floats, other strings their integer prefix.
fn to_number(value: &Value) -> Number {
    match value.to_liquid() {
        Value::Int(i) => Number::Int(BigInt::from(i)),
        Value::BigInt(i) => Number::Int(i.as_ref().clone()),
        Value::Float(f) => Number::Float(f),
        Value::Str(s) => {
            let s = s.trim();
            if DECIMAL.is_match(s) {
                Number::Float(s.parse().unwrap_or(0.0))
            } else {
                Number::Int(BigInt::from(leading_int(s)))
            }
        }
        _ => Number::Int(BigInt::from(0)),
    }
}

impl Number {
    fn to_f64(&self) -> f64 {
        match self {
            Self::Int(i) => i.to_f64().unwrap_or(f64::NAN),
            Self::Float(f) => *f,
        }
    }
}

fn arithmetic(
    left: &Value,
    right: &Value,
    int_op: fn(BigInt, BigInt) -> BigInt,
    float_op: fn(f64, f64) -> f64,
) -> Value {
    match (to_number(left), to_number(right)) {
        (Number::Int(a), Number::Int(b)) => Value::from_bigint(int_op(a, b)),
        (a, b) => Value::Float(float_op(a.to_f64(), b.to_f64())),
    }
}

// ============================================================================
// Collections
// ============================================================================

fn size(input: Value, _: &[Value], _: Option<&Map>, context: &Context<'_>) -> RenderResult<Value> {
    let size = match &input {
        Value::Drop(drop) => drop.resolve_command("size", context)?,
        other => other.builtin_command("size"),
    };
    Ok(size.unwrap_or(Value::Int(0)))
}

/// The input as the array filters see it: arrays flattened, hashes and
/// scalars wrapped, nil empty.
fn input_items(input: &Value) -> Vec<Value> {
    fn flatten_into(items: &[Value], out: &mut Vec<Value>) {
        for item in items {
            match item {
                Value::Array(nested) => flatten_into(nested, out),
                other => out.push(other.clone()),
            }
        }
    }
    match input.to_liquid() {
        Value::Nil => Vec::new(),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            flatten_into(&items, &mut out);
            out
        }
        range @ Value::Range(..) => range.to_items(),
        other => vec![other],
    }
}

fn join(input: Value, args: &[Value], _: Option<&Map>, _: &Context<'_>) -> RenderResult<Value> {
    let glue = args.first().map_or_else(|| " ".to_owned(), ToString::to_string);
    let joined = input_items(&input)
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(&glue);
    Ok(Value::from(joined))
}

fn concat(input: Value, args: &[Value], _: Option<&Map>, _: &Context<'_>) -> RenderResult<Value> {
    let Value::Array(other) = args[0].to_liquid() else {
        return Err(LiquidError::argument("concat filter requires an array argument"));
    };
    let mut items = input_items(&input);
    items.extend(other.iter().cloned());
    Ok(Value::array(items))
}

fn slice(input: Value, args: &[Value], _: Option<&Map>, _: &Context<'_>) -> RenderResult<Value> {
    let offset = to_integer(&args[0])?;
    let length = match args.get(1) {
        Some(length) if !length.is_nil() => to_integer(length)?,
        _ => 1,
    };
    match input.to_liquid() {
        Value::Array(items) => Ok(Value::array(
            slice_bounds(items.len(), offset, length).map_or_else(Vec::new, |range| items[range].to_vec()),
        )),
        other => {
            let text = other.to_string();
            let chars: Vec<char> = text.chars().collect();
            let sliced = slice_bounds(chars.len(), offset, length).map_or_else(String::new, |range| chars[range].iter().collect());
            Ok(Value::from(sliced))
        }
    }
}

/// Index range for `offset, length` slicing of `len` items; negative offsets
/// count from the end. `None` when the offset is out of range or the length negative.
fn slice_bounds(len: usize, offset: i64, length: i64) -> Option<std::ops::Range<usize>> {
    let len_i = usize_to_i64(len);
    let start = if offset < 0 { len_i + offset } else { offset };
    if start < 0 || start > len_i || length < 0 {
        return None;
    }
    let end = start.saturating_add(length).min(len_i);
    Some(usize::try_from(start).ok()?..usize::try_from(end).ok()?)
}

fn map(input: Value, args: &[Value], _: Option<&Map>, context: &Context<'_>) -> RenderResult<Value> {
    let property = args[0].to_string();
    let key = Value::from(property.as_str());
    let mut mapped = Vec::new();
    for item in input_items(&input) {
        if property == "to_liquid" {
            mapped.push(item);
            continue;
        }
        let value = match &item {
            Value::Drop(drop) => drop.resolve_key(&key, context)?,
            Value::Map(map) => map.get(property.as_str()).cloned(),
            Value::Array(_) => return Err(LiquidError::argument(format!("cannot select the property '{property}'"))),
            _ => None,
        };
        mapped.push(value.unwrap_or_default());
    }
    Ok(Value::array(mapped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(builtin: BuiltinFilter, input: Value, args: &[Value]) -> RenderResult<Value> {
        let mut filters = FilterRegistry::new();
        register(&mut filters);
        let mut context = Context::new(&filters);
        context.apply_builtin_filter(builtin, input, args, None)
    }

    fn text(builtin: BuiltinFilter, input: Value, args: &[Value]) -> String {
        call(builtin, input, args).unwrap().to_string()
    }

    #[test]
    fn default_respects_allow_false() {
        let mut filters = FilterRegistry::new();
        register(&mut filters);
        let mut context = Context::new(&filters);
        let fallback = [Value::from("none")];
        let value = context.apply_builtin_filter(BuiltinFilter::Default, Value::Bool(false), &fallback, None).unwrap();
        assert_eq!(value.to_string(), "none");
        let mut keywords = Map::new();
        keywords.insert("allow_false".to_owned(), Value::Bool(true));
        let value = context
            .apply_builtin_filter(BuiltinFilter::Default, Value::Bool(false), &fallback, Some(&keywords))
            .unwrap();
        assert_eq!(value.to_string(), "false");
        assert_eq!(text(BuiltinFilter::Default, Value::from(""), &fallback), "none");
    }

    #[test]
    fn string_filters() {
        assert_eq!(text(BuiltinFilter::Capitalize, Value::from("hELLO"), &[]), "Hello");
        assert_eq!(text(BuiltinFilter::Append, Value::from("a"), &[Value::from(1)]), "a1");
        assert_eq!(text(BuiltinFilter::Strip, Value::from("  x "), &[]), "x");
        assert_eq!(split(" a  b ", " "), ["a", "b"]);
        assert_eq!(split("a,b,,", ","), ["a", "b"]);
        assert_eq!(split("abc", ""), ["a", "b", "c"]);
    }

    #[test]
    fn arithmetic_promotes_to_float() {
        assert_eq!(text(BuiltinFilter::Plus, Value::from(1), &[Value::from("2")]), "3");
        assert_eq!(text(BuiltinFilter::Plus, Value::from("1.5"), &[Value::from(1)]), "2.5");
        assert_eq!(text(BuiltinFilter::Times, Value::Int(i64::MAX), &[Value::from(2)]), "18446744073709551614");
        assert_eq!(text(BuiltinFilter::Minus, Value::from("abc"), &[Value::from(1)]), "-1");
    }

    #[test]
    fn collection_filters() {
        let items = Value::array(vec![Value::from(1), Value::array(vec![Value::from(2), Value::from(3)])]);
        assert_eq!(text(BuiltinFilter::Join, items.clone(), &[Value::from("-")]), "1-2-3");
        assert_eq!(text(BuiltinFilter::Size, Value::from("abc"), &[]), "3");
        assert_eq!(text(BuiltinFilter::Size, Value::Nil, &[]), "0");
        assert_eq!(text(BuiltinFilter::First, items, &[]), "1");
        assert_eq!(text(BuiltinFilter::Slice, Value::from("hello"), &[Value::from(-3), Value::from(2)]), "ll");
        assert_eq!(text(BuiltinFilter::Slice, Value::from("hello"), &[Value::from(9)]), "");
    }

    #[test]
    fn concat_requires_an_array() {
        let err = call(BuiltinFilter::Concat, Value::Nil, &[Value::from(1)]).unwrap_err();
        assert_eq!(err.message(), "concat filter requires an array argument");
        let joined = call(BuiltinFilter::Concat, Value::from("a"), &[Value::array(vec![Value::from("b")])]).unwrap();
        assert_eq!(joined.to_string(), "ab");
    }

    #[test]
    fn map_reads_hash_keys() {
        let mut first = Map::new();
        first.insert("name".to_owned(), Value::from("a"));
        let mut second = Map::new();
        second.insert("name".to_owned(), Value::from("b"));
        let items = Value::array(vec![Value::map(first), Value::map(second)]);
        assert_eq!(text(BuiltinFilter::Map, items, &[Value::from("name")]), "ab");
    }
}
