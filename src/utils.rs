pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Worker loops to run when the config does not say: one per available core.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_WORKER_COUNT)
}
