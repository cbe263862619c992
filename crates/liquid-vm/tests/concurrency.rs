//! One parsed template rendered from many threads at once.

use std::thread;

use liquid_vm::{Engine, EngineConfig, Environment, LimitsConfig, Map, Template, TemplateEngine, Value};

const SOURCE: &str = "{% assign total = 0 %}{% for i in (1..n) %}{% assign total = total | plus: i %}{% endfor %}\
                      {{ name | upcase }}={{ total }}{% increment calls %}";

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn templates_and_engines_are_shareable() {
    assert_send_sync::<Template>();
    assert_send_sync::<Engine>();
}

#[test]
fn parallel_renders_do_not_interfere() {
    let engine = Engine::new(Environment::standard(), EngineConfig::default());
    let template = engine.parse(SOURCE).unwrap();
    thread::scope(|scope| {
        let handles: Vec<_> = (1..=8i64)
            .map(|n| {
                let (engine, template) = (&engine, &template);
                scope.spawn(move || {
                    let mut outputs = Vec::new();
                    for _ in 0..50 {
                        let mut assigns = Map::new();
                        assigns.insert("n".to_owned(), Value::Int(n));
                        assigns.insert("name".to_owned(), Value::from(format!("t{n}")));
                        outputs.push(engine.render(template, assigns).unwrap());
                    }
                    (n, outputs)
                })
            })
            .collect();
        for handle in handles {
            let (n, outputs) = handle.join().unwrap();
            let expected = format!("T{n}={}0", n * (n + 1) / 2);
            assert!(outputs.iter().all(|output| *output == expected), "thread {n}: {outputs:?}");
        }
    });
}

#[test]
fn limits_are_per_context() {
    let config = EngineConfig {
        limits: LimitsConfig {
            render_score_limit: Some(20),
            ..LimitsConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(Environment::standard(), config);
    let template = engine.parse(SOURCE).unwrap();
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..10 {
                    let mut assigns = Map::new();
                    assigns.insert("n".to_owned(), Value::Int(3));
                    assigns.insert("name".to_owned(), Value::from("a"));
                    assert_eq!(engine.render(&template, assigns).unwrap(), "A=60");
                }
            });
        }
    });
}
