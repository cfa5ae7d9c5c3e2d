//! Terminal output for the `opstats` binary.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::cmd::ConvertSummary;

pub struct CliLogger {
    json: bool,
    no_color: bool,
}

impl CliLogger {
    pub fn new(json: bool, no_color: bool) -> Self {
        Self { json, no_color }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn print_serialized<T: Serialize>(&self, value: &T) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(value)?);
            return Ok(());
        }

        let rendered = render_value(&serde_json::to_value(value)?, 0);
        println!("{rendered}");
        Ok(())
    }

    /// Human-readable one-capture summary.
    pub fn print_summary(&self, summary: &ConvertSummary) {
        let status = if summary.errors.is_empty() {
            self.style("OK", "32;1")
        } else {
            self.style("DEGRADED", "33;1")
        };

        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {}\n",
            self.style("opstats", "36;1"),
            self.style(&summary.capture, "37;1"),
            status
        ));
        out.push_str(&format!(
            "{} {} x{} ({})\n",
            self.style("device", "90"),
            summary.device_type,
            summary.device_core_count,
            summary.hardware_kind
        ));
        out.push_str(&format!(
            "{} device={} host={} idle={:.1}%\n",
            self.style("ops", "90"),
            summary.device_ops,
            summary.host_ops,
            summary.device_idle_ratio * 100.0
        ));
        out.push_str(&format!(
            "{} count={} dropped={}\n",
            self.style("steps", "90"),
            summary.steps,
            summary.steps_dropped
        ));
        out.push_str(&format!("{} {}\n", self.style("kernels", "90"), summary.kernels));
        if summary.framework_ops > 0 {
            out.push_str(&format!(
                "{} {}\n",
                self.style("framework_ops", "90"),
                summary.framework_ops
            ));
        }
        if summary.tf_functions > 0 {
            out.push_str(&format!(
                "{} {}\n",
                self.style("tf_functions", "90"),
                summary.tf_functions
            ));
        }
        if let Some(ratio) = summary.host_infeed_enqueue_ratio {
            out.push_str(&format!(
                "{} {:.1}%\n",
                self.style("infeed_enqueue", "90"),
                ratio * 100.0
            ));
        }
        if let Some(duty_cycle) = summary.duty_cycle {
            out.push_str(&format!(
                "{} {:.1}%\n",
                self.style("duty_cycle", "90"),
                duty_cycle * 100.0
            ));
        }
        if summary.is_training {
            out.push_str(&format!("{} training\n", self.style("mode", "90")));
        }
        out.push_str(&format!(
            "{} {}\n",
            self.style("fingerprint", "90"),
            summary.fingerprint
        ));
        if let Some(path) = &summary.report_path {
            out.push_str(&format!("{} {}\n", self.style("report", "90"), path));
        }

        if !summary.errors.is_empty() || !summary.warnings.is_empty() {
            out.push_str(&format!("{}\n", self.style("diagnostics", "33;1")));
            for error in &summary.errors {
                out.push_str(&format!("  - [error] {error}\n"));
            }
            for warning in &summary.warnings {
                out.push_str(&format!("  - [warning] {warning}\n"));
            }
        }

        println!("{}", out.trim_end());
    }

    pub fn print_error(&self, msg: &str) {
        if self.json {
            println!("{}", diagnostic_json("error", msg));
            return;
        }
        eprintln!("{} {msg}", self.style("error", "31;1"));
    }

    /// Written to stderr in both modes.
    pub fn print_warning(&self, msg: &str) {
        if self.json {
            eprintln!("{}", diagnostic_json("warning", msg));
            return;
        }
        eprintln!("{} {msg}", self.style("warn", "33;1"));
    }

    fn style(&self, text: &str, ansi: &str) -> String {
        if self.no_color {
            return text.to_string();
        }
        format!("\x1b[{ansi}m{text}\x1b[0m")
    }
}

fn diagnostic_json(level: &str, msg: &str) -> Value {
    serde_json::json!({ "tool": "opstats", "level": level, "message": msg })
}

fn render_value(value: &Value, indent: usize) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Number(v) => v.to_string(),
        Value::String(v) => v.clone(),
        Value::Array(items) => render_array(items, indent),
        Value::Object(map) => render_object(map, indent),
    }
}

fn render_array(items: &[Value], indent: usize) -> String {
    if items.is_empty() {
        return "[]".to_string();
    }

    let pad = " ".repeat(indent);
    let mut out = String::new();
    for item in items {
        match item {
            Value::Object(_) | Value::Array(_) => {
                out.push_str(&format!("{pad}-\n{}\n", render_value(item, indent + 2)));
            }
            _ => out.push_str(&format!("{pad}- {}\n", render_value(item, indent + 2))),
        }
    }
    out.trim_end().to_string()
}

fn render_object(map: &serde_json::Map<String, Value>, indent: usize) -> String {
    if map.is_empty() {
        return "{}".to_string();
    }

    let pad = " ".repeat(indent);
    let mut out = String::new();
    for (key, value) in map {
        match value {
            Value::Object(_) | Value::Array(_) => {
                out.push_str(&format!(
                    "{pad}{key}:\n{}\n",
                    render_value(value, indent + 2)
                ));
            }
            _ => out.push_str(&format!(
                "{pad}{key}: {}\n",
                render_value(value, indent + 2)
            )),
        }
    }
    out.trim_end().to_string()
}
