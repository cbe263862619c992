//! Dumping parsed templates and rendering the loaded copies.
//!
//! A loaded template must render exactly like the template it was dumped from.

use liquid_vm::{
    Backend, Context, Engine, EngineConfig, Environment, ErrorKind, LiquidDrop, LiquidError, Map, ParseOptions,
    RenderResult, TemplateEngine, Value, serialize::FORMAT_VERSION,
};
use pretty_assertions::assert_eq;

#[derive(Debug)]
struct ErrorDrop;

impl LiquidDrop for ErrorDrop {
    fn resolve_key(&self, _key: &Value, _context: &Context<'_>) -> RenderResult<Option<Value>> {
        Err(LiquidError::standard("standard error"))
    }
}

fn engine(config: EngineConfig) -> Engine {
    Engine::new(Environment::standard(), config)
}

/// Parses, dumps, loads and renders `source`.
fn round_trip(engine: &Engine, source: &str, assigns: Map) -> String {
    let template = engine.parse(source).unwrap();
    let bytes = engine.dump(&template).unwrap();
    let loaded = engine.load(&bytes).unwrap();
    assert_eq!(loaded.disassemble(), template.disassemble());
    assert_eq!(loaded.root().node_count(), template.root().node_count());
    engine.render(&loaded, assigns).unwrap()
}

#[test]
fn loops_with_break_survive_a_dump() {
    let engine = engine(EngineConfig::default());
    let source = "{% for i in (1..5) %}{% if i > 3 %}{% break %}{% endif %}{{ i }}{% endfor %}";
    assert_eq!(round_trip(&engine, source, Map::new()), "123");
}

#[test]
fn line_numbers_survive_a_dump() {
    let config = EngineConfig {
        parse: ParseOptions {
            line_numbers: true,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    let engine = engine(config);
    let mut assigns = Map::new();
    assigns.insert("drop".to_owned(), Value::drop(ErrorDrop));
    let output = round_trip(
        &engine,
        "{% comment %}\n\n{% endcomment %}{{ drop.value }}",
        assigns,
    );
    assert_eq!(output, "Liquid error (line 3): standard error");
}

#[test]
fn every_standard_tag_reloads() {
    let engine = engine(EngineConfig::default());
    let source = "{% assign a = 'x' | upcase %}{% capture c %}[{{ a }}]{% endcapture %}\
                  {% raw %}{{ raw }}{% endraw %}{% comment %}gone{% endcomment %}\
                  {% unless a == 'y' %}{{ c }}{% endunless %}\
                  {% for i in (1..3) %}{% if i == 2 %}{% continue %}{% endif %}{% increment k %}{% endfor %}\
                  {% echo 'e' %}{% liquid\n  echo 'l'\n%}";
    assert_eq!(round_trip(&engine, source, Map::new()), "{{ raw }}[X]01el");
}

#[test]
fn walked_and_legacy_templates_reload() {
    let walked = EngineConfig {
        parse: ParseOptions {
            disable_compiled_nodes: true,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    let legacy = EngineConfig {
        backend: Backend::Legacy,
        ..EngineConfig::default()
    };
    let source = "{% if flag %}{{ name | append: '!' }}{% else %}no{% endif %}";
    for config in [walked, legacy] {
        let engine = engine(config);
        let mut assigns = Map::new();
        assigns.insert("flag".to_owned(), Value::Bool(true));
        assigns.insert("name".to_owned(), Value::from("hi"));
        assert_eq!(round_trip(&engine, source, assigns), "hi!");
    }
}

#[test]
fn fallback_flag_is_kept() {
    let engine = engine(EngineConfig::default());
    let template = engine.parse("{{ a }}").unwrap();
    assert!(!template.used_fallback());
    let loaded = engine.load(&engine.dump(&template).unwrap()).unwrap();
    assert!(!loaded.used_fallback());
    assert!(loaded.warnings().is_empty());
}

#[test]
fn corrupt_dumps_are_rejected() {
    let engine = engine(EngineConfig::default());
    let template = engine.parse("{{ a | upcase }}").unwrap();
    let mut bytes = engine.dump(&template).unwrap();

    let err = engine.load(&[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Serialization);

    // the version is the first varint; bump it past the current one
    assert!(FORMAT_VERSION < 0x7f);
    bytes[0] = u8::try_from(FORMAT_VERSION + 1).unwrap();
    let err = engine.load(&bytes).unwrap_err();
    assert_eq!(
        err.message(),
        format!("unsupported template format version {}, expected {FORMAT_VERSION}", FORMAT_VERSION + 1)
    );
}
