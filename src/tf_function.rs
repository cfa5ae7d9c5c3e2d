//! Per-function call statistics collected from host threads.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::safe_divide;

/// How a framework function call was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TfFunctionExecutionMode {
    Eager,
    Concrete,
    Traced,
    NotTraced,
}

impl TfFunctionExecutionMode {
    /// Eager calls and calls that had to trace are the expensive ones.
    pub fn is_expensive(self) -> bool {
        matches!(self, Self::Eager | Self::Traced)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TfFunctionCompiler {
    #[default]
    Invalid,
    Other,
    Mixed,
    Xla,
}

impl TfFunctionCompiler {
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Invalid, c) | (c, Self::Invalid) => c,
            (a, b) if a == b => a,
            _ => Self::Mixed,
        }
    }
}

/// Decodes a `tf_function_call` stat value.
pub fn decode_tf_function_call(raw: &str) -> Option<(TfFunctionExecutionMode, TfFunctionCompiler)> {
    use TfFunctionCompiler as C;
    use TfFunctionExecutionMode as M;
    match raw {
        "eager" => Some((M::Eager, C::Invalid)),
        "concrete" => Some((M::Concrete, C::Invalid)),
        "traced-xla" => Some((M::Traced, C::Xla)),
        "traced-nonXla" => Some((M::Traced, C::Other)),
        "notTraced-xla" => Some((M::NotTraced, C::Xla)),
        "notTraced-nonXla" => Some((M::NotTraced, C::Other)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TfFunctionMetrics {
    pub count: u64,
    pub self_time_ps: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TfFunction {
    pub total_tracing_count: u64,
    pub compiler: TfFunctionCompiler,
    /// Share of self time spent in eager or traced calls, in percent.
    pub expensive_call_percent: f64,
    pub metrics: BTreeMap<TfFunctionExecutionMode, TfFunctionMetrics>,
}

impl TfFunction {
    pub fn record_call(
        &mut self,
        mode: TfFunctionExecutionMode,
        compiler: TfFunctionCompiler,
        tracing_count: u64,
        self_time_ps: u64,
    ) {
        self.total_tracing_count = self.total_tracing_count.max(tracing_count);
        self.compiler = self.compiler.combine(compiler);
        let metrics = self.metrics.entry(mode).or_default();
        metrics.count = metrics.count.saturating_add(1);
        metrics.self_time_ps = metrics.self_time_ps.saturating_add(self_time_ps);
        self.update_expensive_call_percent();
    }

    pub fn combine(&mut self, src: &TfFunction) {
        self.total_tracing_count = self.total_tracing_count.max(src.total_tracing_count);
        self.compiler = self.compiler.combine(src.compiler);
        for (mode, metrics) in &src.metrics {
            let dst = self.metrics.entry(*mode).or_default();
            dst.count = dst.count.saturating_add(metrics.count);
            dst.self_time_ps = dst.self_time_ps.saturating_add(metrics.self_time_ps);
        }
        self.update_expensive_call_percent();
    }

    fn update_expensive_call_percent(&mut self) {
        let total: u64 = self.metrics.values().map(|m| m.self_time_ps).sum();
        let expensive: u64 = self
            .metrics
            .iter()
            .filter(|(mode, _)| mode.is_expensive())
            .map(|(_, m)| m.self_time_ps)
            .sum();
        self.expensive_call_percent = 100.0 * safe_divide(expensive as f64, total as f64);
    }
}

/// Keyed by function name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TfFunctionDb {
    pub functions: BTreeMap<String, TfFunction>,
}

impl TfFunctionDb {
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn combine(&mut self, src: &TfFunctionDb) {
        for (name, function) in &src.functions {
            self.functions.entry(name.clone()).or_default().combine(function);
        }
    }
}
