use std::{env, fs, process::ExitCode, time::Instant};

use liquid_vm::{
    Engine, EngineConfig, Environment, Map, Template, TemplateEngine, Value,
    tracer::{NoopTracer, ProfilingTracer, StderrTracer, VmTracer},
};

const USAGE: &str = "\
usage: liquid-vm <command> [--config <config.json>] [--trace | --profile] <args>

commands:
  render <template> [assigns.json]   parse and render a template
  disassemble <template>             print the bytecode of every compiled body
  dump <template> <out>              write the parsed template to <out>
  load <dump> [assigns.json]         render a previously dumped template

--trace logs every instruction, filter and tag to stderr while rendering;
--profile prints opcode, filter and tag counts after the render.";

/// How renders are observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceMode {
    Off,
    Log,
    Profile,
}

fn main() -> ExitCode {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let config = match take_config(&mut args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let trace = if take_flag(&mut args, "--profile") {
        TraceMode::Profile
    } else if take_flag(&mut args, "--trace") {
        TraceMode::Log
    } else {
        TraceMode::Off
    };
    let engine = Engine::new(Environment::standard(), config);

    let result = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["render", template] => render(&engine, template, None, trace),
        ["render", template, assigns] => render(&engine, template, Some(assigns), trace),
        ["disassemble", template] => disassemble(&engine, template),
        ["dump", template, out] => dump(&engine, template, out),
        ["load", dump] => load(&engine, dump, None, trace),
        ["load", dump, assigns] => load(&engine, dump, Some(assigns), trace),
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Removes `flag` from `args`, reporting whether it was present.
fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|arg| arg != flag);
    args.len() != before
}

/// Removes `--config <path>` from `args` and reads the engine config it names.
fn take_config(args: &mut Vec<String>) -> Result<EngineConfig, String> {
    let Some(index) = args.iter().position(|arg| arg == "--config") else {
        return Ok(EngineConfig::default());
    };
    if index + 1 >= args.len() {
        return Err("--config requires a path".to_owned());
    }
    let path = args.remove(index + 1);
    args.remove(index);
    let json = read_file(&path)?;
    EngineConfig::from_json(&json).map_err(|err| format!("invalid config {path}: {err}"))
}

fn render(engine: &Engine, template_path: &str, assigns_path: Option<&str>, trace: TraceMode) -> Result<(), String> {
    let source = fs::read(template_path).map_err(|err| format!("reading file {template_path}: {err}"))?;
    let start = Instant::now();
    let template = engine.parse_bytes(&source).map_err(|err| err.to_string())?;
    eprintln!("parsed in {:?}", start.elapsed());
    render_template(engine, &template, assigns_path, trace)
}

fn disassemble(engine: &Engine, template_path: &str) -> Result<(), String> {
    let source = fs::read(template_path).map_err(|err| format!("reading file {template_path}: {err}"))?;
    let template = engine.parse_bytes(&source).map_err(|err| err.to_string())?;
    if template.used_fallback() {
        eprintln!("template was parsed by the legacy parser; nothing to disassemble");
    }
    print!("{}", template.disassemble());
    Ok(())
}

fn dump(engine: &Engine, template_path: &str, out_path: &str) -> Result<(), String> {
    let source = fs::read(template_path).map_err(|err| format!("reading file {template_path}: {err}"))?;
    let template = engine.parse_bytes(&source).map_err(|err| err.to_string())?;
    let bytes = engine.dump(&template).map_err(|err| err.to_string())?;
    fs::write(out_path, &bytes).map_err(|err| format!("writing file {out_path}: {err}"))?;
    eprintln!("wrote {} bytes to {out_path}", bytes.len());
    Ok(())
}

fn load(engine: &Engine, dump_path: &str, assigns_path: Option<&str>, trace: TraceMode) -> Result<(), String> {
    let bytes = fs::read(dump_path).map_err(|err| format!("reading file {dump_path}: {err}"))?;
    let start = Instant::now();
    let template = engine.load(&bytes).map_err(|err| err.to_string())?;
    eprintln!("loaded in {:?}", start.elapsed());
    render_template(engine, &template, assigns_path, trace)
}

fn render_template(
    engine: &Engine,
    template: &Template,
    assigns_path: Option<&str>,
    trace: TraceMode,
) -> Result<(), String> {
    for warning in template.warnings() {
        eprintln!("warning: {warning}");
    }
    let assigns = match assigns_path {
        Some(path) => read_assigns(path)?,
        None => Map::new(),
    };
    let mut noop = NoopTracer;
    let mut log = StderrTracer::new();
    let mut profile = ProfilingTracer::new();
    let tracer: &mut dyn VmTracer = match trace {
        TraceMode::Off => &mut noop,
        TraceMode::Log => &mut log,
        TraceMode::Profile => &mut profile,
    };

    let mut context = engine.new_context(assigns);
    context.set_tracer(tracer);
    let start = Instant::now();
    let output = template.render(&mut context).map_err(|err| err.to_string())?;
    let elapsed = start.elapsed();
    print!("{output}");
    for err in context.errors() {
        eprintln!("render error: {err}");
    }
    drop(context);
    eprintln!("rendered in {elapsed:?}");
    if trace == TraceMode::Profile {
        eprint!("{}", profile.report());
    }
    Ok(())
}

/// Reads a JSON object of top-level assigns.
fn read_assigns(path: &str) -> Result<Map, String> {
    let json = read_file(path)?;
    let value: serde_json::Value = serde_json::from_str(&json).map_err(|err| format!("invalid JSON in {path}: {err}"))?;
    let serde_json::Value::Object(object) = value else {
        return Err(format!("{path}: assigns must be a JSON object"));
    };
    Ok(object.into_iter().map(|(key, value)| (key, Value::from_json(value))).collect())
}

fn read_file(file_path: &str) -> Result<String, String> {
    fs::read_to_string(file_path).map_err(|err| format!("reading file {file_path}: {err}"))
}
