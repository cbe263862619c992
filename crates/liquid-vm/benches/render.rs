use criterion::{Bencher, Criterion, black_box, criterion_group, criterion_main};
use liquid_vm::{Backend, Engine, EngineConfig, Environment, Map, ParseOptions, TemplateEngine, Value};

const PRODUCT_LIST: &str = "\
<ul>
{% for product in products %}
  <li class=\"{% if forloop.first %}first{% else %}item{% endif %}\">
    {{ product.title | upcase | append: '!' }} - {{ product.price | times: 2 | default: 0 }}
    {% if product.tags contains 'sale' %}<b>sale</b>{% endif %}
  </li>
{% endfor %}
</ul>";

const ASSIGN_LOOP: &str = "\
{% assign total = 0 %}{% for i in (1..200) %}{% assign total = total | plus: i %}{% endfor %}{{ total }}";

fn products() -> Map {
    let products: Vec<serde_json::Value> = (0..50)
        .map(|i| {
            serde_json::json!({
                "title": format!("product number {i}"),
                "price": i * 3,
                "tags": if i % 4 == 0 { vec!["sale", "new"] } else { vec!["new"] },
            })
        })
        .collect();
    let mut assigns = Map::new();
    assigns.insert("products".to_owned(), Value::from_json(serde_json::Value::Array(products)));
    assigns
}

fn engine(backend: Backend, compiled: bool) -> Engine {
    let config = EngineConfig {
        backend,
        parse: ParseOptions {
            disable_compiled_nodes: !compiled,
            ..ParseOptions::default()
        },
        ..EngineConfig::default()
    };
    Engine::new(Environment::standard(), config)
}

/// Parses `source` once and measures repeated renders.
fn run_render(bench: &mut Bencher, engine: &Engine, source: &str, assigns: &Map) {
    let template = engine.parse(source).unwrap();
    let expected = engine.render(&template, assigns.clone()).unwrap();
    assert!(!expected.contains("Liquid error"), "{expected}");

    bench.iter(|| {
        let output = engine.render(&template, assigns.clone()).unwrap();
        black_box(output);
    });
}

fn run_parse(bench: &mut Bencher, engine: &Engine, source: &str) {
    bench.iter(|| black_box(engine.parse(source).unwrap()));
}

fn criterion_benchmark(c: &mut Criterion) {
    let assigns = products();
    let compiled = engine(Backend::Accelerated, true);
    let walked = engine(Backend::Accelerated, false);
    let legacy = engine(Backend::Legacy, true);

    c.bench_function("product_list__compiled", |b| {
        run_render(b, &compiled, PRODUCT_LIST, &assigns);
    });
    c.bench_function("product_list__walked", |b| run_render(b, &walked, PRODUCT_LIST, &assigns));
    c.bench_function("product_list__legacy", |b| run_render(b, &legacy, PRODUCT_LIST, &assigns));

    c.bench_function("assign_loop__compiled", |b| {
        run_render(b, &compiled, ASSIGN_LOOP, &Map::new());
    });
    c.bench_function("assign_loop__legacy", |b| run_render(b, &legacy, ASSIGN_LOOP, &Map::new()));

    c.bench_function("parse_product_list__compiled", |b| run_parse(b, &compiled, PRODUCT_LIST));
    c.bench_function("parse_product_list__legacy", |b| run_parse(b, &legacy, PRODUCT_LIST));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
