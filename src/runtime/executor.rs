use crate::OpStatsResult;

/// Number of workers and their thread-name prefix.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// `None` means one worker per available CPU.
    pub worker_threads: Option<usize>,
    pub name_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            name_prefix: "op_stats_threads".to_string(),
        }
    }
}

/// A private work-stealing pool. Tasks are submitted inside [`Executor::scope`]
/// and the scope returns only after every task has finished, so tasks may
/// borrow from the caller as long as each writes to its own slot.
pub struct Executor {
    pool: rayon::ThreadPool,
}

impl Executor {
    pub fn new(config: &ExecutorConfig) -> OpStatsResult<Self> {
        let prefix = config.name_prefix.clone();
        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(move |idx| format!("{prefix}-{idx}"));
        if let Some(n) = config.worker_threads {
            builder = builder.num_threads(n.max(1));
        }
        let pool = builder.build()?;
        tracing::debug!("started executor with {} workers", pool.current_num_threads());
        Ok(Self { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` with a scope to spawn tasks into, then joins all of them.
    pub fn scope<'scope, OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce(&rayon::Scope<'scope>) -> R + Send,
        R: Send,
    {
        self.pool.scope(op)
    }
}
