//! Render cost ceilings: output length, node count and retained assigns.

use liquid_vm::{Engine, EngineConfig, Environment, ErrorKind, LimitsConfig, Map, ParseOptions, TemplateEngine};
use pretty_assertions::assert_eq;

const LIMIT_TEXT: &str = "Liquid error: Memory limits exceeded";

fn engine(limits: LimitsConfig, compiled: bool) -> Engine {
    let config = EngineConfig {
        parse: ParseOptions {
            disable_compiled_nodes: !compiled,
            ..ParseOptions::default()
        },
        limits,
        ..EngineConfig::default()
    };
    Engine::new(Environment::standard(), config)
}

/// Renders `source` on both body kinds, checking they agree, and returns the output.
fn render(source: &str, limits: LimitsConfig) -> String {
    let outputs: Vec<String> = [true, false]
        .into_iter()
        .map(|compiled| {
            let engine = engine(limits, compiled);
            let template = engine.parse(source).unwrap();
            engine.render(&template, Map::new()).unwrap()
        })
        .collect();
    assert_eq!(outputs[0], outputs[1], "compiled and walked bodies disagree on {source:?}");
    outputs[0].clone()
}

#[test]
fn render_length_limit() {
    let limits = LimitsConfig {
        render_length_limit: Some(5),
        ..LimitsConfig::default()
    };
    assert_eq!(render("{{ 'abcde' }}", limits), "abcde");
    assert_eq!(render("{{ 'abcdef' }}", limits), LIMIT_TEXT);
    assert_eq!(render("abc{% if true %}def{% endif %}", limits), LIMIT_TEXT);
}

#[test]
fn render_score_limit() {
    let limits = LimitsConfig {
        render_score_limit: Some(5),
        ..LimitsConfig::default()
    };
    assert_eq!(render("{% for i in (1..4) %}{{ i }}{% endfor %}", limits), "1234");
    assert_eq!(render("{% for i in (1..10) %}{{ i }}{% endfor %}", limits), LIMIT_TEXT);
}

#[test]
fn assign_score_limit() {
    let limits = LimitsConfig {
        assign_score_limit: Some(5),
        ..LimitsConfig::default()
    };
    assert_eq!(render("{% assign a = 'abcde' %}{{ a }}", limits), "abcde");
    assert_eq!(render("{% assign a = 'abcdef' %}{{ a }}", limits), LIMIT_TEXT);
}

#[test]
fn captures_charge_the_assign_score() {
    let limits = LimitsConfig {
        assign_score_limit: Some(5),
        render_length_limit: Some(100),
        ..LimitsConfig::default()
    };
    assert_eq!(render("{% capture c %}abc{% endcapture %}{{ c }}", limits), "abc");
    assert_eq!(
        render("{% capture c %}{{ 'abc' }}{{ 'def' }}{% endcapture %}{{ c }}", limits),
        LIMIT_TEXT
    );
}

#[test]
fn limit_errors_escape_rescue_regions() {
    let limits = LimitsConfig {
        render_length_limit: Some(3),
        ..LimitsConfig::default()
    };
    let engine = engine(limits, true);
    let template = engine.parse("{{ 'abcd' | upcase }}after").unwrap();
    let mut context = engine.new_context(Map::new());
    assert_eq!(template.render(&mut context).unwrap(), LIMIT_TEXT);
    assert!(context.resource_limits().reached());
    assert_eq!(context.errors().len(), 1);
    assert_eq!(context.errors()[0].kind(), ErrorKind::ResourceLimit);
}

#[test]
fn limit_errors_are_rethrown_on_request() {
    let config = EngineConfig {
        limits: LimitsConfig {
            render_length_limit: Some(1),
            ..LimitsConfig::default()
        },
        ..EngineConfig::from_json(r#"{"render": {"rethrow_errors": true}}"#).unwrap()
    };
    let engine = Engine::new(Environment::standard(), config);
    let template = engine.parse("ab").unwrap();
    let err = engine.render(&template, Map::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    assert_eq!(err.to_string(), LIMIT_TEXT);
}

#[test]
fn counters_are_visible_after_a_render() {
    let engine = engine(LimitsConfig::default(), true);
    let template = engine
        .parse("{% assign a = 'xyz' %}{% for i in (1..2) %}{{ i }}{% endfor %}")
        .unwrap();
    let mut context = engine.new_context(Map::new());
    assert_eq!(template.render(&mut context).unwrap(), "12");
    let limits = context.resource_limits();
    assert_eq!(limits.render_length(), 2);
    assert_eq!(limits.assign_score(), 3);
    // root (2 nodes) plus one node per iteration
    assert_eq!(limits.render_score(), 4);
    assert!(!limits.reached());
}
