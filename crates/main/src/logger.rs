//! Logging setup: env-filtered stdout plus an optional daily-rolling
//! file, both driven by the `log` config section. Panics from any bot
//! task are routed into the log stream before the process dies.

use tracing::{error, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use utility::config::LogConfig;

pub fn init(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let guard = set_subscriber(config)?;
    install_panic_hook();

    Ok(guard)
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic| {
        let location = panic
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));

        error!(
            message = %panic,
            location = location.as_deref().unwrap_or("unknown"),
            "Panic in a bot task.",
        );
    }));
}

fn set_subscriber(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level: Level = config.level.parse().unwrap_or(Level::INFO);

    let filter = || -> anyhow::Result<EnvFilter> {
        Ok(EnvFilter::from_default_env()
            .add_directive("hyper=info".parse()?)
            .add_directive("reqwest=info".parse()?)
            .add_directive("rustls=info".parse()?)
            .add_directive("h2=info".parse()?)
            .add_directive("sqlx=warn".parse()?)
            .add_directive(level.into()))
    };

    let stdout_layer = fmt::Layer::new()
        .with_ansi(true)
        .with_writer(std::io::stdout)
        .with_filter(filter()?);

    if config.file.is_empty() {
        tracing_subscriber::registry().with(stdout_layer).init();
        return Ok(None);
    }

    std::fs::create_dir_all(&config.file)?;

    let file_appender = tracing_appender::rolling::daily(&config.file, "output.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(
            fmt::Layer::new()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(filter()?),
        )
        .init();

    Ok(Some(guard))
}
