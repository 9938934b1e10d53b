use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber. Safe to call once at
/// process start; a second call is a no-op (the underlying `set_global_default`
/// error is swallowed since tests may initialize more than once).
pub fn init(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
