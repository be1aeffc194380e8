use std::fs;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "mesh-node.log";

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop and must live as long as the process.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.level_filter()?.into())
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.json {
        layers.push(Box::new(tracing_subscriber::fmt::layer().json()));
    } else {
        layers.push(Box::new(tracing_subscriber::fmt::layer().with_target(true)));
    }

    let mut guard = None;
    if let Some(dir) = &config.log_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, worker) = tracing_appender::non_blocking(appender);
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        ));
        guard = Some(worker);
    }

    layers.push(Box::new(filter));

    Registry::default()
        .with(layers)
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(guard)
}
