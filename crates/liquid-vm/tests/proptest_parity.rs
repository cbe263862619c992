//! Property tests: the parser never panics, and every backend renders
//! generated templates identically.

use liquid_vm::{Backend, Engine, EngineConfig, Environment, ErrorMode, Map, ParseOptions, TemplateEngine, Value};
use proptest::prelude::*;

fn engine(backend: Backend, compiled: bool, error_mode: ErrorMode) -> Engine {
    let config = EngineConfig {
        backend,
        parse: ParseOptions {
            error_mode,
            disable_compiled_nodes: !compiled,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    Engine::new(Environment::standard(), config)
}

fn assigns() -> Map {
    let mut assigns = Map::new();
    assigns.insert("a".to_owned(), Value::from("Hello"));
    assigns.insert("b".to_owned(), Value::from(" mixed Case "));
    assigns.insert("n".to_owned(), Value::Int(7));
    assigns.insert("list".to_owned(), Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
    assigns
}

fn text() -> impl Strategy<Value = String> {
    "[a-z ,.\n]{0,8}"
}

fn variable() -> impl Strategy<Value = String> {
    let name = prop::sample::select(vec!["a", "b", "n", "list", "list.size", "list[1]", "missing", "'lit'", "42"]);
    let filters = prop::collection::vec(
        prop::sample::select(vec!["upcase", "downcase", "capitalize", "strip", "size", "plus: 1", "append: '!'"]),
        0..3,
    );
    (name, filters).prop_map(|(name, filters)| {
        let mut markup = format!("{{{{ {name}");
        for filter in filters {
            markup.push_str(" | ");
            markup.push_str(filter);
        }
        markup.push_str(" }}");
        markup
    })
}

fn segment() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![text(), variable()];
    leaf.prop_recursive(3, 16, 4, |inner| {
        let condition = prop::sample::select(vec!["a", "missing", "n > 3", "a == 'Hello'", "list contains 2"]);
        prop_oneof![
            (condition, prop::collection::vec(inner.clone(), 0..4), prop::collection::vec(inner.clone(), 0..3))
                .prop_map(|(condition, then, otherwise)| {
                    format!("{{% if {condition} %}}{}{{% else %}}{}{{% endif %}}", then.concat(), otherwise.concat())
                }),
            prop::collection::vec(inner, 0..3)
                .prop_map(|body| format!("{{% for item in list %}}{{{{ item }}}}{}{{% endfor %}}", body.concat())),
        ]
    })
}

fn template() -> impl Strategy<Value = String> {
    prop::collection::vec(segment(), 0..6).prop_map(|segments| segments.concat())
}

proptest! {
    #[test]
    fn parsing_never_panics(source in "[a-z0-9 {}%|:,.='\"()\\[\\]\n-]{0,48}") {
        for mode in [ErrorMode::Lax, ErrorMode::Warn, ErrorMode::Strict] {
            for backend in [Backend::Accelerated, Backend::Legacy] {
                let engine = engine(backend, true, mode);
                if let Ok(template) = engine.parse(&source) {
                    let _ = engine.render(&template, assigns());
                }
            }
        }
    }

    #[test]
    fn backends_render_alike(source in template()) {
        let compiled = engine(Backend::Accelerated, true, ErrorMode::Strict);
        let walked = engine(Backend::Accelerated, false, ErrorMode::Strict);
        let legacy = engine(Backend::Legacy, true, ErrorMode::Lax);

        let expected = compiled.render(&compiled.parse(&source).unwrap(), assigns()).unwrap();
        let template = walked.parse(&source).unwrap();
        prop_assert_eq!(&walked.render(&template, assigns()).unwrap(), &expected);
        let template = legacy.parse(&source).unwrap();
        prop_assert_eq!(&legacy.render(&template, assigns()).unwrap(), &expected);
    }

    #[test]
    fn dumps_render_like_their_source(source in template()) {
        let engine = engine(Backend::Accelerated, true, ErrorMode::Strict);
        let template = engine.parse(&source).unwrap();
        let loaded = engine.load(&engine.dump(&template).unwrap()).unwrap();
        prop_assert_eq!(loaded.disassemble(), template.disassemble());
        prop_assert_eq!(
            engine.render(&loaded, assigns()).unwrap(),
            engine.render(&template, assigns()).unwrap()
        );
    }
}
