//! Thread pool management for extraction
//!
//! Per-block work inside one rank (smoothing, gradients, slab triangulation)
//! runs on a process-wide rayon pool configured once from the command line.
//! Ranks themselves are separate threads and each installs work into the
//! same pool.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::{Arc, Mutex, OnceLock};
use amrsurf_core::{Error, Result};

static GLOBAL_THREAD_POOL: OnceLock<Option<Arc<ThreadPool>>> = OnceLock::new();
static THREAD_POOL_CONFIG: Mutex<ThreadPoolConfig> = Mutex::new(ThreadPoolConfig::new());

const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Thread pool configuration for parallel processing
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of threads to use (None = one per core)
    pub num_threads: Option<usize>,
    /// Thread stack size in bytes
    pub stack_size: Option<usize>,
    /// Thread name prefix
    pub thread_name_prefix: String,
    /// Enable parallel processing (can be disabled for debugging)
    pub enabled: bool,
    /// Inputs shorter than this are processed sequentially
    pub min_chunk_size: usize,
}

impl ThreadPoolConfig {
    const fn new() -> Self {
        Self {
            num_threads: None,
            stack_size: None,
            thread_name_prefix: String::new(),
            enabled: true,
            min_chunk_size: 2,
        }
    }

    /// Set number of threads
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Set stack size
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Enable or disable parallel processing
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the sequential cutoff
    pub fn with_min_chunk_size(mut self, min: usize) -> Self {
        self.min_chunk_size = min;
        self
    }

    fn build_pool(&self) -> Result<ThreadPool> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(num_threads) = self.num_threads {
            builder = builder.num_threads(num_threads);
        }
        builder = builder.stack_size(self.stack_size.unwrap_or(DEFAULT_STACK_SIZE));
        if !self.thread_name_prefix.is_empty() {
            let prefix = self.thread_name_prefix.clone();
            builder = builder.thread_name(move |index| format!("{}-{}", prefix, index));
        }
        builder
            .build()
            .map_err(|e| Error::Algorithm(format!("Failed to create thread pool: {}", e)))
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            stack_size: Some(DEFAULT_STACK_SIZE),
            thread_name_prefix: "amrsurf-worker".to_string(),
            ..Self::new()
        }
    }
}

/// Initialize the global thread pool with custom configuration.
///
/// Only the first call takes effect; later calls are no-ops.
///
/// ```rust
/// use amrsurf_reconstruction::parallel::{init_thread_pool, ThreadPoolConfig};
///
/// let config = ThreadPoolConfig::default()
///     .with_threads(4)
///     .with_stack_size(16 * 1024 * 1024);
///
/// init_thread_pool(config).expect("Failed to initialize thread pool");
/// ```
pub fn init_thread_pool(config: ThreadPoolConfig) -> Result<()> {
    if GLOBAL_THREAD_POOL.get().is_some() {
        return Ok(());
    }

    let pool = config.build_pool()?;
    log::debug!(
        "Initialized thread pool with {} threads",
        pool.current_num_threads()
    );

    if let Ok(mut global_config) = THREAD_POOL_CONFIG.lock() {
        *global_config = config;
    }

    GLOBAL_THREAD_POOL
        .set(Some(Arc::new(pool)))
        .map_err(|_| Error::Algorithm("Thread pool already initialized".to_string()))
}

/// Get the global thread pool, initializing with defaults if needed.
///
/// `None` when no pool could be created; work then runs on rayon's
/// implicit global pool.
pub fn get_thread_pool() -> Option<Arc<ThreadPool>> {
    GLOBAL_THREAD_POOL
        .get_or_init(|| match ThreadPoolConfig::default().build_pool() {
            Ok(pool) => Some(Arc::new(pool)),
            Err(e) => {
                log::warn!("{}, falling back to the implicit rayon pool", e);
                None
            }
        })
        .clone()
}

/// Get current thread pool configuration
pub fn get_config() -> ThreadPoolConfig {
    THREAD_POOL_CONFIG
        .lock()
        .map(|config| config.clone())
        .unwrap_or_else(|_| ThreadPoolConfig::default())
}

/// Check if parallel processing is enabled
pub fn is_parallel_enabled() -> bool {
    get_config().enabled
}

/// Number of threads work is spread across
pub fn current_num_threads() -> usize {
    if !is_parallel_enabled() {
        return 1;
    }
    get_thread_pool()
        .map(|pool| pool.current_num_threads())
        .unwrap_or_else(rayon::current_num_threads)
}

/// Execute a parallel operation with the global thread pool
pub fn execute_parallel<F, R>(op: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    match get_thread_pool() {
        Some(pool) if is_parallel_enabled() => pool.install(op),
        _ => op(),
    }
}

/// Parallel map preserving input order
pub fn parallel_map<T, U, F>(data: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync + Send,
{
    if !is_parallel_enabled() || data.len() < get_config().min_chunk_size {
        return data.iter().map(f).collect();
    }

    execute_parallel(|| data.par_iter().map(f).collect())
}
