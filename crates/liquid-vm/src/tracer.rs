//! Render tracing infrastructure.
//!
//! The [`VmTracer`] trait defines hook points at the events that matter when
//! debugging or profiling a template render: instruction dispatch, filter
//! invocation, opaque tag dispatch and recovered errors. A tracer is attached
//! to a [`Context`](crate::Context) for one render; without one installed the
//! VM skips every hook.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | No-op (what an unset tracer behaves like) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode, filter and tag frequency counters |
//! | [`RecordingTracer`] | Full event recording for post-mortem analysis |
//!
//! ```ignore
//! let mut tracer = ProfilingTracer::new();
//! let mut context = engine.new_context(assigns);
//! context.set_tracer(&mut tracer);
//! template.render(&mut context)?;
//! drop(context);
//! println!("{}", tracer.report());
//! ```

use ahash::AHashMap;

use crate::{bytecode::Opcode, error::LiquidError};

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// An opcode was dispatched at the given IP.
    Instruction {
        /// Byte offset of the opcode in its program.
        ip: usize,
        opcode: Opcode,
        /// Operand stack depth at dispatch.
        stack_depth: usize,
    },
    /// A filter was applied.
    Filter {
        name: String,
        /// Total argument count including the input value.
        argc: usize,
    },
    /// An opaque tag node was rendered through its runtime hook.
    Node { tag: String, line_number: Option<u32> },
    /// An error reached a guarded region or the context error hook.
    Error {
        message: String,
        /// Whether the render continued after the error.
        recovered: bool,
    },
}

/// Trait for render tracing.
///
/// All methods have default no-op implementations; implementations only
/// override the hooks they care about.
pub trait VmTracer: std::fmt::Debug {
    /// Called before each opcode dispatch.
    ///
    /// This is the hottest hook. Implementations should be as lightweight as possible.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize) {}

    /// Called before a filter is applied, with the argument count including the input.
    #[inline(always)]
    fn on_filter(&mut self, _name: &str, _argc: usize) {}

    /// Called before an opaque tag node renders.
    #[inline(always)]
    fn on_node(&mut self, _tag: &str, _line_number: Option<u32>) {}

    /// Called when an error is routed through the context error hook.
    #[inline(always)]
    fn on_error(&mut self, _error: &LiquidError, _recovered: bool) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

// ============================================================================
// StderrTracer
// ============================================================================

/// Tracer that prints a human-readable execution log to stderr.
///
/// ```text
/// [    0] FindStaticVar     stack=0
/// [    3] LookupConstKey    stack=1
///   >>> FILTER upcase       argc=1
///   >>> TAG for             line=Some(2)
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Maximum number of instructions to trace before going quiet.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that stops logging after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("[{ip:>5}] {opcode:<18?}stack={stack_depth}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_filter(&mut self, name: &str, argc: usize) {
        if self.stopped {
            return;
        }
        eprintln!("  >>> FILTER {name:<12} argc={argc}");
    }

    fn on_node(&mut self, tag: &str, line_number: Option<u32>) {
        if self.stopped {
            return;
        }
        eprintln!("  >>> TAG {tag:<15} line={line_number:?}");
    }

    fn on_error(&mut self, error: &LiquidError, recovered: bool) {
        if self.stopped {
            return;
        }
        let action = if recovered { "recovered" } else { "raised" };
        eprintln!("  !!! {action}: {error}");
    }
}

// ============================================================================
// ProfilingTracer
// ============================================================================

/// Tracer that collects execution statistics.
///
/// Retrieve results via [`ProfilingTracer::report`] after the render.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: AHashMap<Opcode, u64>,
    filter_counts: AHashMap<String, u64>,
    tag_counts: AHashMap<String, u64>,
    total_instructions: u64,
    max_stack_depth: usize,
    errors: u64,
}

/// Summary report from a profiling trace.
#[derive(Debug)]
pub struct ProfilingReport {
    /// Per-opcode execution counts, most executed first.
    pub opcode_counts: Vec<(Opcode, u64)>,
    /// Per-filter invocation counts, most used first.
    pub filter_counts: Vec<(String, u64)>,
    /// Per-tag render counts, most used first.
    pub tag_counts: Vec<(String, u64)>,
    pub total_instructions: u64,
    pub max_stack_depth: usize,
    /// Errors routed through the error hook.
    pub errors: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a profiling report, counts sorted by frequency.
    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        fn sorted<K: Clone + Ord>(map: &AHashMap<K, u64>) -> Vec<(K, u64)> {
            let mut counts: Vec<_> = map.iter().map(|(k, &v)| (k.clone(), v)).collect();
            counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            counts
        }
        ProfilingReport {
            opcode_counts: sorted(&self.opcode_counts),
            filter_counts: sorted(&self.filter_counts),
            tag_counts: sorted(&self.tag_counts),
            total_instructions: self.total_instructions,
            max_stack_depth: self.max_stack_depth,
            errors: self.errors,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, stack_depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
        self.max_stack_depth = self.max_stack_depth.max(stack_depth);
    }

    fn on_filter(&mut self, name: &str, _argc: usize) {
        *self.filter_counts.entry(name.to_owned()).or_insert(0) += 1;
    }

    fn on_node(&mut self, tag: &str, _line_number: Option<u32>) {
        *self.tag_counts.entry(tag.to_owned()).or_insert(0) += 1;
    }

    fn on_error(&mut self, _error: &LiquidError, _recovered: bool) {
        self.errors += 1;
    }
}

impl std::fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Render Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Max stack depth:    {}", self.max_stack_depth)?;
        writeln!(f, "Errors:             {}", self.errors)?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions.max(1) as f64) * 100.0;
            writeln!(f, "  {opcode:<20?} {count:>10}  ({pct:>5.1}%)")?;
        }
        if !self.filter_counts.is_empty() {
            writeln!(f, "--- Filters ---")?;
            for (name, count) in &self.filter_counts {
                writeln!(f, "  {name:<20} {count:>10}")?;
            }
        }
        if !self.tag_counts.is_empty() {
            writeln!(f, "--- Tags ---")?;
            for (name, count) in &self.tag_counts {
                writeln!(f, "  {name:<20} {count:>10}")?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// Tracer that records all events in chronological order.
///
/// Allocates per event, so use it only for short renders or tests.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder that stops after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_some_and(|l| self.events.len() >= l) {
            return;
        }
        self.events.push(event);
    }
}

impl VmTracer for RecordingTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        self.record(TraceEvent::Instruction {
            ip,
            opcode,
            stack_depth,
        });
    }

    fn on_filter(&mut self, name: &str, argc: usize) {
        self.record(TraceEvent::Filter {
            name: name.to_owned(),
            argc,
        });
    }

    fn on_node(&mut self, tag: &str, line_number: Option<u32>) {
        self.record(TraceEvent::Node {
            tag: tag.to_owned(),
            line_number,
        });
    }

    fn on_error(&mut self, error: &LiquidError, recovered: bool) {
        self.record(TraceEvent::Error {
            message: error.to_string(),
            recovered,
        });
    }
}
