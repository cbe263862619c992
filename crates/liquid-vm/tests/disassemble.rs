//! Listings of compiled templates and standalone expressions.

use liquid_vm::{
    Engine, EngineConfig, Environment, Expression, ParseOptions, TemplateEngine, parser::strict_parse_expression,
};
use pretty_assertions::assert_eq;

fn engine(line_numbers: bool) -> Engine {
    let config = EngineConfig {
        parse: ParseOptions {
            line_numbers,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    Engine::new(Environment::standard(), config)
}

#[test]
fn variable_with_keyword_filter_and_tag() {
    let source = "raw\n{{- var | default: \"none\", allow_false: true -}}\n{%- increment counter -%}";
    let template = engine(true).parse(source).unwrap();
    assert_eq!(
        template.disassemble(),
        "0x0000: write_raw(\"raw\")\n\
         0x0005: render_variable_rescue(line_number: 2)\n\
         0x0009: find_static_var(\"var\")\n\
         0x000c: push_const(\"none\")\n\
         0x000f: push_const(\"allow_false\")\n\
         0x0012: push_true\n\
         0x0013: hash_new(1)\n\
         0x0015: builtin_filter(name: :default, num_args: 3)\n\
         0x0018: pop_write\n\
         0x0019: write_node({% increment counter %})\n\
         0x001c: leave\n"
    );
}

#[test]
fn unknown_filters_are_called_by_name() {
    let template = engine(false).parse("{{ a | shout: 1 }}").unwrap();
    assert_eq!(
        template.disassemble(),
        "0x0000: render_variable_rescue(line_number: 1)\n\
         0x0004: find_static_var(\"a\")\n\
         0x0007: push_int8(1)\n\
         0x0009: filter(name: :shout, num_args: 2)\n\
         0x000d: pop_write\n\
         0x000e: leave\n"
    );
}

#[test]
fn echo_is_lowered_inline() {
    let template = engine(false).parse("{% echo x.size %}").unwrap();
    let listing = template.disassemble();
    assert!(!listing.contains("write_node"), "{listing}");
    assert!(listing.contains("lookup_command(\"size\")"), "{listing}");
}

#[test]
fn block_tags_dispatch_at_runtime() {
    let template = engine(false).parse("{% if a %}yes{% endif %}").unwrap();
    assert_eq!(
        template.disassemble(),
        "0x0000: write_node({% if a %})\n0x0003: leave\n"
    );
}

#[test]
fn dynamic_lookups() {
    let expression = strict_parse_expression("a[b].c[0]").unwrap();
    let compiled = match Expression::compile(expression).unwrap() {
        Expression::Compiled(compiled) => compiled,
        other => panic!("expected a compiled expression, got {other:?}"),
    };
    assert_eq!(
        compiled.disassemble(),
        "0x0000: find_static_var(\"a\")\n\
         0x0003: find_static_var(\"b\")\n\
         0x0006: lookup_key\n\
         0x0007: lookup_const_key(\"c\")\n\
         0x000a: push_int8(0)\n\
         0x000c: lookup_key\n\
         0x000d: leave\n"
    );
}

#[test]
fn walked_templates_have_no_listing() {
    let config = EngineConfig {
        parse: ParseOptions {
            disable_compiled_nodes: true,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    let template = Engine::new(Environment::standard(), config).parse("{{ a }}").unwrap();
    assert_eq!(template.disassemble(), "");
}
