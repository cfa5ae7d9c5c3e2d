//! `opstats convert ...`

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};

use std::path::Path;

use opstats::{
    Config, ConvertOptions, ExecutorConfig, OpStats, TraceSpace, convert_trace_space_to_op_stats,
    default_report_path, find_capture_files,
};

use crate::cli_logger::CliLogger;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Convert trace captures into op statistics reports
    Convert(ConvertArgs),
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Capture files, directories or glob patterns
    #[arg(value_name = "CAPTURE_OR_GLOB", required = true)]
    pub captures: Vec<String>,
    #[arg(long)]
    pub no_op_metrics: bool,
    #[arg(long)]
    pub no_steps: bool,
    #[arg(long)]
    pub no_kernels: bool,
    #[arg(long)]
    pub drop_incomplete_steps: bool,
    /// Worker threads; overrides `worker_threads` from the config
    #[arg(long)]
    pub threads: Option<usize>,
    /// Write each report next to its capture as `<name>.op_stats.json`
    #[arg(long)]
    pub write: bool,
    /// Print the whole report instead of a summary
    #[arg(long)]
    pub full: bool,
}

impl ConvertArgs {
    /// Flags can only switch outputs off, never back on.
    pub fn options(&self, base: ConvertOptions) -> ConvertOptions {
        ConvertOptions {
            generate_op_metrics_db: base.generate_op_metrics_db && !self.no_op_metrics,
            generate_step_db: base.generate_step_db && !self.no_steps,
            generate_kernel_stats_db: base.generate_kernel_stats_db && !self.no_kernels,
            maybe_drop_incomplete_steps: base.maybe_drop_incomplete_steps
                || self.drop_incomplete_steps,
        }
    }

    pub fn executor_config(&self, config: &Config) -> ExecutorConfig {
        let mut out = config.executor_config();
        if self.threads.is_some() {
            out.worker_threads = self.threads;
        }
        out
    }
}

/// What the text output shows for one converted capture.
#[derive(Debug, Clone)]
pub struct ConvertSummary {
    pub capture: String,
    pub report_path: Option<String>,
    pub fingerprint: String,
    pub hardware_kind: String,
    pub device_type: String,
    pub device_core_count: u32,
    pub device_ops: usize,
    pub framework_ops: usize,
    pub host_ops: usize,
    pub host_infeed_enqueue_ratio: Option<f64>,
    pub device_idle_ratio: f64,
    pub steps: usize,
    pub steps_dropped: u32,
    pub kernels: usize,
    pub tf_functions: usize,
    pub duty_cycle: Option<f64>,
    pub is_training: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConvertSummary {
    pub fn from_op_stats(
        capture: &Path,
        report_path: Option<&Path>,
        stats: &OpStats,
    ) -> Result<Self> {
        let device = &stats.device_op_metrics_db;
        let tracked_ps = device.duty_cycle_busy_ps.saturating_add(device.duty_cycle_idle_ps);
        Ok(Self {
            capture: capture.display().to_string(),
            report_path: report_path.map(|p| p.display().to_string()),
            fingerprint: stats.fingerprint()?,
            hardware_kind: stats
                .run_environment
                .hardware_kind
                .map(|kind| format!("{kind:?}").to_lowercase())
                .unwrap_or_default(),
            device_type: stats.run_environment.device_type.clone(),
            device_core_count: stats.run_environment.device_core_count,
            device_ops: device.len(),
            framework_ops: stats.framework_op_metrics_db.len(),
            host_ops: stats.host_op_metrics_db.len(),
            host_infeed_enqueue_ratio: stats.host_op_metrics_db.host_infeed_enqueue_ratio(),
            device_idle_ratio: device.idle_time_ratio(),
            steps: stats.step_db.len(),
            steps_dropped: stats.step_db.num_steps_dropped,
            kernels: stats.kernel_stats_db.reports.len(),
            tf_functions: stats.tf_function_db.len(),
            duty_cycle: (tracked_ps > 0)
                .then(|| device.duty_cycle_busy_ps as f64 / tracked_ps as f64),
            is_training: stats.run_environment.is_training,
            errors: stats.diagnostics.errors.iter().cloned().collect(),
            warnings: stats.diagnostics.warnings.iter().cloned().collect(),
        })
    }
}

/// Converts every matched capture. A capture that cannot be read is reported
/// and skipped; the command fails if any capture was skipped.
pub fn run_convert(args: &ConvertArgs, config: &Config, logger: &CliLogger) -> Result<()> {
    let captures = find_capture_files(&args.captures)?;
    if captures.is_empty() {
        bail!("no captures matched {:?}", args.captures);
    }
    let options = args.options(config.convert);
    let executor_config = args.executor_config(config);

    let mut failed = 0usize;
    for capture in &captures {
        let space = match TraceSpace::read_json(capture) {
            Ok(space) => space,
            Err(err) => {
                logger.print_warning(&format!("skipping {}: {err}", capture.display()));
                failed += 1;
                continue;
            }
        };
        let stats = convert_trace_space_to_op_stats(&space, &options, &executor_config)
            .with_context(|| format!("converting {}", capture.display()))?;

        let report_path = if args.write {
            let path = default_report_path(capture);
            stats
                .write_json(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            Some(path)
        } else {
            None
        };

        if logger.is_json() || args.full {
            logger.print_serialized(&stats)?;
        } else {
            let summary =
                ConvertSummary::from_op_stats(capture, report_path.as_deref(), &stats)?;
            logger.print_summary(&summary);
        }
    }

    if failed > 0 {
        bail!("{failed} of {} captures could not be read", captures.len());
    }
    Ok(())
}
