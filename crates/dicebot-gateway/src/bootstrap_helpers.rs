use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `--log-level` wins over `RUST_LOG`; the
/// fallback is `warn`.
pub(crate) fn init_tracing(log_level: Option<&str>) {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(log_level))
        .with_target(false)
        .compact()
        .init();
}

fn build_env_filter(log_level: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::WARN.into());
    match log_level.map(str::trim).filter(|level| !level.is_empty()) {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.from_env_lossy(),
    }
}
