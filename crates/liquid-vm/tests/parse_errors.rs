//! Syntax errors, error modes and the lax fallback.

use std::{cell::RefCell, rc::Rc};

use liquid_vm::{Engine, EngineConfig, Environment, ErrorKind, ErrorMode, Map, ParseOptions, TemplateEngine};
use pretty_assertions::assert_eq;

fn engine(error_mode: ErrorMode) -> Engine {
    let config = EngineConfig {
        parse: ParseOptions {
            error_mode,
            line_numbers: true,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    Engine::new(Environment::standard(), config)
}

fn strict_error(source: &str) -> String {
    engine(ErrorMode::Strict).parse(source).unwrap_err().to_string()
}

#[test]
fn strict_mode_reports_the_offending_markup() {
    assert_eq!(
        strict_error("a\n{{ x | }}"),
        "Liquid syntax error (line 2): Expected id but found end_of_string in \"{{ x | }}\""
    );
    assert_eq!(
        strict_error("{% if a = b %}{% endif %}"),
        "Liquid syntax error (line 1): Unexpected character = in \"a = b\""
    );
    assert_eq!(
        strict_error("{% for x y %}{% endfor %}"),
        "Liquid syntax error (line 1): For loops require an 'in' clause in \"x y\""
    );
}

#[test]
fn structural_errors_ignore_the_error_mode() {
    for mode in [ErrorMode::Lax, ErrorMode::Warn, ErrorMode::Strict] {
        let err = engine(mode).parse("{% if a %}\n{% endfor %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert_eq!(
            err.to_string(),
            "Liquid syntax error (line 2): 'endfor' is not a valid delimiter for if tags. use endif"
        );
        let err = engine(mode).parse("{% nope %}").unwrap_err();
        assert_eq!(err.message(), "Unknown tag 'nope'");
        let err = engine(mode).parse("{{ a ").unwrap_err();
        assert!(err.message().starts_with("Variable '{{"), "{err}");
    }
}

#[test]
fn lax_mode_falls_back_silently() {
    let engine = engine(ErrorMode::Lax);
    let template = engine.parse("{{ a ;; | upcase }}").unwrap();
    assert!(template.warnings().is_empty());
    let mut assigns = Map::new();
    assigns.insert("a".to_owned(), "x".into());
    assert_eq!(engine.render(&template, assigns).unwrap(), "X");
}

#[test]
fn warn_mode_keeps_warnings() {
    let engine = engine(ErrorMode::Warn);
    let template = engine.parse("{{ a ;; }}\n{% if x == 1 ;; %}{% endif %}").unwrap();
    let warnings: Vec<String> = template.warnings().iter().map(ToString::to_string).collect();
    assert_eq!(warnings.len(), 2, "{warnings:?}");
    assert!(warnings[0].contains("(line 1)"), "{warnings:?}");
    assert_eq!(
        warnings[1],
        "Liquid syntax error (line 2): Unexpected character ; in \"x == 1 ;;\""
    );
}

#[test]
fn fallback_observer_sees_variable_markup() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&seen);
    let engine = engine(ErrorMode::Lax);
    engine
        .parse_with_observer("{{ ok }}{{ bad bad }}{% if a %}{{ 'x' 'y' }}{% endif %}", move |markup| {
            observed.borrow_mut().push(markup.to_owned());
        })
        .unwrap();
    assert_eq!(*seen.borrow(), [" bad bad ", " 'x' 'y' "]);
}

#[test]
fn lax_conditions_still_reject_unknown_operators() {
    let engine = engine(ErrorMode::Lax);
    let template = engine.parse("{% if a == b ;; %}yes{% else %}no{% endif %}").unwrap();
    assert_eq!(engine.render(&template, Map::new()).unwrap(), "yes");
    let err = engine.parse("\n{% if a = b %}yes{% endif %}").unwrap_err();
    assert_eq!(err.to_string(), "Liquid syntax error (line 2): Unknown operator =");
}

#[test]
fn tag_syntax_errors() {
    let lax = engine(ErrorMode::Lax);
    assert_eq!(
        lax.parse("{% assign %}").unwrap_err().message(),
        "Syntax Error in 'assign' - Valid syntax: assign [var] = [source]"
    );
    assert_eq!(
        lax.parse("{% capture %}{% endcapture %}").unwrap_err().message(),
        "Syntax Error in 'capture' - Valid syntax: capture [var]"
    );
    assert_eq!(
        lax.parse("{% for %}{% endfor %}").unwrap_err().message(),
        "Syntax Error in 'for loop' - Valid syntax: for [item] in [collection]"
    );
    assert_eq!(
        lax.parse("{% raw x %}{% endraw %}").unwrap_err().message(),
        "Syntax Error in 'raw' - Valid syntax: {% raw %}{% endraw %}"
    );
    assert_eq!(lax.parse("{% raw %}").unwrap_err().message(), "'raw' tag was never closed");
}

#[test]
fn nesting_is_bounded() {
    let depth = 101;
    let source = format!("{}{}", "{% if true %}".repeat(depth), "{% endif %}".repeat(depth));
    let err = engine(ErrorMode::Lax).parse(&source).unwrap_err();
    assert_eq!(err.message(), "Nesting too deep");
    let source = format!("{}x{}", "{% if true %}".repeat(50), "{% endif %}".repeat(50));
    let engine = engine(ErrorMode::Lax);
    let template = engine.parse(&source).unwrap();
    assert_eq!(engine.render(&template, Map::new()).unwrap(), "x");
}
