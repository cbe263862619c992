//! Host values, scopes and error hooks as seen through a render context.

use liquid_vm::{
    Context, Engine, EngineConfig, Environment, LiquidDrop, LiquidError, Map, ParseOptions, RenderResult,
    TemplateEngine, Value,
    tracer::{ProfilingTracer, RecordingTracer, TraceEvent},
};
use pretty_assertions::assert_eq;

/// Reports whether a filter is running when it is asked for a key.
#[derive(Debug)]
struct FilteringDrop;

impl LiquidDrop for FilteringDrop {
    fn resolve_key(&self, key: &Value, context: &Context<'_>) -> RenderResult<Option<Value>> {
        Ok((key.as_str() == Some("is_filtering")).then(|| Value::Bool(context.filtering())))
    }
}

/// Stands for a plain number.
#[derive(Debug)]
struct NumberDrop(i64);

impl LiquidDrop for NumberDrop {
    fn to_liquid_value(&self) -> Option<Value> {
        Some(Value::Int(self.0))
    }
}

/// Raises on every key.
#[derive(Debug)]
struct FailingDrop;

impl LiquidDrop for FailingDrop {
    fn resolve_key(&self, _key: &Value, _context: &Context<'_>) -> RenderResult<Option<Value>> {
        Err(LiquidError::standard("standard error"))
    }

    fn render_text(&self, _context: &Context<'_>) -> RenderResult<String> {
        Ok("failing".to_owned())
    }
}

/// Answers `size` differently as a command and as a key.
#[derive(Debug)]
struct SizedDrop;

impl LiquidDrop for SizedDrop {
    fn resolve_key(&self, key: &Value, _context: &Context<'_>) -> RenderResult<Option<Value>> {
        Ok((key.as_str() == Some("size")).then(|| Value::from("key")))
    }

    fn resolve_command(&self, name: &str, _context: &Context<'_>) -> RenderResult<Option<Value>> {
        Ok((name == "size").then(|| Value::from("command")))
    }
}

fn engine() -> Engine {
    Engine::new(Environment::standard(), EngineConfig::default())
}

#[test]
fn drops_see_whether_a_filter_is_running() {
    let engine = engine();
    let template = engine
        .parse("{{ test[0].is_filtering }},{{ test | map: \"is_filtering\" }}")
        .unwrap();
    let mut assigns = Map::new();
    assigns.insert("test".to_owned(), Value::array(vec![Value::drop(FilteringDrop)]));
    assert_eq!(engine.render(&template, assigns).unwrap(), "false,true");
}

#[test]
fn drops_with_plain_values_compare_and_render() {
    let engine = engine();
    let template = engine
        .parse("{{ n }} {% if n == 3 %}eq{% endif %} {% if n > 2 %}gt{% endif %} {{ n | plus: 1 }}")
        .unwrap();
    let mut assigns = Map::new();
    assigns.insert("n".to_owned(), Value::drop(NumberDrop(3)));
    assert_eq!(engine.render(&template, assigns).unwrap(), "3 eq gt 4");
}

#[test]
fn drop_errors_are_rendered_in_place() {
    let engine = engine();
    let template = engine.parse("a{{ d.x }}b{{ d }}").unwrap();
    let mut assigns = Map::new();
    assigns.insert("d".to_owned(), Value::drop(FailingDrop));
    let mut context = engine.new_context(assigns);
    assert_eq!(template.render(&mut context).unwrap(), "aLiquid error: standard errorbfailing");
    assert_eq!(context.errors().len(), 1);
}

#[test]
fn drops_without_text_cannot_render() {
    let engine = engine();
    let template = engine.parse("{{ d }}").unwrap();
    let mut assigns = Map::new();
    assigns.insert("d".to_owned(), Value::drop(FilteringDrop));
    assert_eq!(
        engine.render(&template, assigns).unwrap(),
        "Liquid error: Drop can't be converted to a string"
    );
}

#[test]
fn static_environment_sits_below_assigns() {
    let engine = engine();
    let template = engine.parse("{{ shop }} {{ user }}").unwrap();
    let mut environment = Map::new();
    environment.insert("shop".to_owned(), Value::from("store"));
    environment.insert("user".to_owned(), Value::from("env"));
    let mut assigns = Map::new();
    assigns.insert("user".to_owned(), Value::from("assigned"));
    let mut context = engine.new_context(assigns).with_static_environment(environment);
    assert_eq!(template.render(&mut context).unwrap(), "store assigned");
}

#[test]
fn scopes_shadow_and_pop() {
    let environment = Environment::standard();
    let mut context = Context::new(&environment.filters);
    context.set("x", Value::from(1));
    let mut inner = Map::new();
    inner.insert("x".to_owned(), Value::from(2));
    let seen = context
        .with_scope(inner, |context| context.find_variable("x", false))
        .unwrap();
    assert_eq!(seen.as_int(), Some(2));
    assert_eq!(context.find_variable("x", false).unwrap().as_int(), Some(1));
    assert!(context.pop_scope().is_none(), "the outermost scope stays");
}

#[test]
fn exception_renderer_replaces_error_text() {
    let engine = engine();
    let template = engine.parse("[{{ 1 | concat: 1 }}]").unwrap();
    let mut context = engine.new_context(Map::new());
    context.set_exception_renderer(|err| Ok(format!("<{}>", err.kind())));
    assert_eq!(template.render(&mut context).unwrap(), "[<argument>]");
}

#[test]
fn tracer_sees_filters_nodes_and_errors() {
    let config = EngineConfig {
        parse: ParseOptions {
            line_numbers: true,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(Environment::standard(), config);
    let template = engine.parse("{{ 'a' | upcase }}\n{% if true %}{{ 1 | concat: 1 }}{% endif %}").unwrap();
    let mut tracer = RecordingTracer::new();
    let mut context = engine.new_context(Map::new());
    context.set_tracer(&mut tracer);
    assert_eq!(
        template.render(&mut context).unwrap(),
        "A\nLiquid error (line 2): concat filter requires an array argument"
    );
    drop(context);

    let events: Vec<_> = tracer
        .into_events()
        .into_iter()
        .filter(|event| !matches!(event, TraceEvent::Instruction { .. }))
        .collect();
    assert_eq!(
        events,
        [
            TraceEvent::Filter {
                name: "upcase".to_owned(),
                argc: 1
            },
            TraceEvent::Node {
                tag: "if".to_owned(),
                line_number: Some(2)
            },
            TraceEvent::Filter {
                name: "concat".to_owned(),
                argc: 2
            },
            TraceEvent::Error {
                message: "Liquid error (line 2): concat filter requires an array argument".to_owned(),
                recovered: true
            },
        ]
    );
}

#[test]
fn profiling_counts_filters_and_tags() {
    let engine = engine();
    let template = engine
        .parse("{% for i in (1..3) %}{{ i | plus: 1 }}{% endfor %}{% if x %}{% endif %}{{ 'a' | upcase }}")
        .unwrap();
    let mut profile = ProfilingTracer::new();
    let mut context = engine.new_context(Map::new());
    context.set_tracer(&mut profile);
    assert_eq!(template.render(&mut context).unwrap(), "234A");
    drop(context);

    let report = profile.report();
    assert_eq!(report.filter_counts, [("plus".to_owned(), 3), ("upcase".to_owned(), 1)]);
    assert_eq!(report.tag_counts, [("for".to_owned(), 1), ("if".to_owned(), 1)]);
    assert_eq!(report.errors, 0);
    assert!(report.total_instructions > 0);
    assert!(report.to_string().starts_with("=== Render Profiling Report ==="));
}

#[test]
fn dotted_size_is_a_command_and_bracketed_size_a_key() {
    let walked = EngineConfig {
        parse: ParseOptions {
            disable_compiled_nodes: true,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    for config in [EngineConfig::default(), walked] {
        let engine = Engine::new(Environment::standard(), config);
        let template = engine
            .parse("{{ obj.size }} {{ obj['size'] }} {% assign k = 'size' %}{{ obj[k] }}")
            .unwrap();
        let mut assigns = Map::new();
        assigns.insert("obj".to_owned(), Value::drop(SizedDrop));
        assert_eq!(engine.render(&template, assigns).unwrap(), "command key key");
    }
}
