use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use snowcast_core::{init_tracing, AppConfig};
use tokio::signal;
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

fn cli() -> Command {
    Command::new("snowcast")
        .version("1.0.0")
        .about("积雪模拟任务编排系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时查找 config/snowcast.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["scheduler", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("覆盖配置中的 Worker ID"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("trigger")
                .long("trigger")
                .value_name("LABEL")
                .help("立即入队一次运行（或 cleanup）后退出"),
        )
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Option<&'a str> {
    matches.get_one::<String>(name).map(String::as_str)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = arg(&matches, "config");
    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认>")))?;

    if let Some(id) = arg(&matches, "worker-id") {
        config.worker.worker_id = id.to_string();
    }

    let log_level = arg(&matches, "log-level")
        .unwrap_or(config.observability.log_level.as_str())
        .to_string();
    let log_format = arg(&matches, "log-format")
        .unwrap_or(config.observability.log_format.as_str())
        .to_string();
    init_tracing(&log_level, &log_format)?;

    let mode: AppMode = arg(&matches, "mode").unwrap_or("all").parse()?;
    info!("Starting snowcast in {:?} mode", mode);
    if let Some(path) = config_path {
        info!("Configuration loaded from {}", path);
    }

    if let Some(label) = arg(&matches, "trigger") {
        let app = Application::new(config, mode).await?;
        return app.trigger(label).await;
    }

    if config.observability.metrics_enabled {
        app::install_metrics_exporter(&config)?;
    }
    app::ensure_directories(&config)?;

    let shutdown_grace = Duration::from_secs(config.worker.shutdown_grace_seconds);
    let app = Arc::new(Application::new(config, mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("Application failed: {:#}", e);
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received, stopping components");
    shutdown_manager.shutdown().await;

    // worker 池自己等待在途任务，这里额外留出收尾时间
    match tokio::time::timeout(shutdown_grace + Duration::from_secs(10), app_handle).await {
        Ok(Ok(())) => info!("Application stopped gracefully"),
        Ok(Err(e)) => error!("Application task failed during shutdown: {}", e),
        Err(_) => warn!("Application shutdown timed out, exiting"),
    }

    info!("snowcast exited");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
