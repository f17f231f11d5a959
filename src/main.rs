use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use scheduler_core::{init_logging, ConfigLoader, WorkerConfig};
use scheduler_worker::{HttpChannel, HttpExecutor, ShellExecutor, WorkerController};
use tokio::signal;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("fleet-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式任务调度Worker")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时只使用默认值与环境变量"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = ConfigLoader::new()
        .load(config_path.map(String::as_str))
        .with_context(|| match config_path {
            Some(path) => format!("加载配置文件失败: {path}"),
            None => "加载配置失败".to_string(),
        })?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.clone();
    }

    init_logging(&config.logging.level, &config.logging.format)?;
    info!("启动分布式任务调度Worker, 集群: {}", config.cluster);

    install_metrics_exporter(&config)?;

    let controller = build_controller(config)?;
    controller.start().await.context("Worker启动失败")?;

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, controller.stop()).await {
        Ok(Ok(())) => info!("Worker已优雅关闭"),
        Ok(Err(e)) => error!("Worker关闭时发生错误: {e}"),
        Err(_) => warn!("Worker关闭超时，强制退出"),
    }

    Ok(())
}

fn install_metrics_exporter(config: &WorkerConfig) -> Result<()> {
    let Some(addr) = config.observability.metrics_addr.as_deref() else {
        return Ok(());
    };
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("无效的指标导出地址: {addr}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;
    info!("Prometheus指标导出地址: {addr}");
    Ok(())
}

fn build_controller(config: WorkerConfig) -> Result<WorkerController> {
    let controller_url = config
        .controller_url
        .clone()
        .context("缺少控制器地址 controller_url")?;
    let channel = Arc::new(HttpChannel::new(&controller_url)?);

    let controller = WorkerController::builder(config, channel)
        .register_executor("shell", Arc::new(ShellExecutor::new()))
        .register_executor("http", Arc::new(HttpExecutor::new()))
        .build()?;
    Ok(controller)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
