use env_logger::{Builder, Env};

/// Installs the process-wide logger. `RUST_LOG` overrides `default_filter`.
/// Returns false if a logger was already installed.
pub fn init(default_filter: &str) -> bool {
    Builder::from_env(Env::default().default_filter_or(default_filter))
        .filter_module("wgpu_hal", log::LevelFilter::Error)
        .filter_module("wgpu_core", log::LevelFilter::Warn)
        .filter_module("naga", log::LevelFilter::Warn)
        .try_init()
        .is_ok()
}

/// Logger for tests: captured by the harness, repeated calls are harmless.
pub fn init_for_tests() {
    let _ = Builder::from_env(Env::default().default_filter_or("debug")).is_test(true).try_init();
}
