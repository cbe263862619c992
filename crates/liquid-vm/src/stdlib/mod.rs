//! Standard tags and filters installed by [`Environment::standard`].

use crate::{
    error::{LiquidError, RenderResult},
    template::Environment,
    value::Value,
};

mod condition;
mod filters;
mod tags;

pub use condition::{Condition, Operator};

/// Installs the standard tags and filters.
pub fn register(environment: &mut Environment) {
    tags::register(&mut environment.tags);
    filters::register(&mut environment.filters);
}

/// Integer conversion for loop attributes and filter arguments: integers, or
/// strings holding exactly one.
fn to_integer(value: &Value) -> RenderResult<i64> {
    match value.to_liquid() {
        Value::Int(i) => Ok(i),
        Value::Str(s) => s.trim().parse().map_err(|_| LiquidError::argument("invalid integer")),
        _ => Err(LiquidError::argument("invalid integer")),
    }
}
