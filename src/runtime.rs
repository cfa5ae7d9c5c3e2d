//! Worker pool scoped to one conversion call.

mod executor;

pub use executor::*;
