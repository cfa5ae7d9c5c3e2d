//! Op statistics from hardware trace captures: op cost tables, step events,
//! kernel reports and duty cycles, computed per device plane in parallel and
//! combined deterministically.

mod config;
mod convert;
mod device_caps;
mod duty_cycle;
mod error;
mod fsutil;
mod kernel_stats;
mod metadata;
mod op_metrics;
mod op_metrics_combiner;
mod op_stats;
mod runtime;
mod schema;
mod step_db;
mod step_events;
mod tf_function;
mod timespan;
mod xspace;

pub use config::*;
pub use convert::*;
pub use device_caps::*;
pub use duty_cycle::*;
pub use error::*;
pub use fsutil::*;
pub use kernel_stats::*;
pub use metadata::*;
pub use op_metrics::*;
pub use op_metrics_combiner::*;
pub use op_stats::*;
pub use runtime::*;
pub use schema::*;
pub use step_db::*;
pub use step_events::*;
pub use tf_function::*;
pub use timespan::*;
pub use xspace::*;
