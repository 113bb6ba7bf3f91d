use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::PathBuf;
use std::fs;

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("page_orchestrator={}", level).parse()?)
        .add_directive("warn".parse()?);

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    // Optional second sink without colors
    let file_layer = match log_file {
        Some(log_file) => {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::File::create(log_file)?;
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(file),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Default log file path in the platform data directory
pub fn default_log_file() -> PathBuf {
    let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "page-orchestrator", "page-orchestrator") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push("orchestrator.log");
    path
}
