use std::num::NonZeroUsize;

bitflags::bitflags! {
    /// Optional self-checks and bookkeeping, off by default.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DebugFlags: u8 {
        /// Record every stored bound per slot so `validate` can replay
        /// histories for monotonicity.
        const RECORD_HISTORY = 1 << 0;
        /// Record which dependee values each derivation observed so
        /// `validate` can cross-check them against final values.
        const RECORD_DERIVATIONS = 1 << 1;
        /// Log every executed task at trace level.
        const TRACE_TASKS = 1 << 2;
    }
}

/// Which scheduler drives the store.
#[derive(Clone, Copy, Debug)]
pub enum Backend {
    /// Single-threaded FIFO worklist; deterministic task order.
    Sequential,
    /// Fixed pool of worker threads.
    Parallel { workers: usize },
}

impl Backend {
    /// Parallel backend sized to the machine.
    pub fn parallel() -> Self {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Backend::Parallel { workers }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    pub backend: Backend,
    pub debug: DebugFlags,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: Backend::Sequential,
            debug: DebugFlags::empty(),
        }
    }
}

impl StoreConfig {
    pub fn sequential() -> Self {
        StoreConfig::default()
    }

    pub fn parallel() -> Self {
        StoreConfig {
            backend: Backend::parallel(),
            debug: DebugFlags::empty(),
        }
    }

    pub fn with_debug(mut self, flags: DebugFlags) -> Self {
        self.debug = flags;
        self
    }
}
