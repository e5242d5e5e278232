//! # Servomaster CLI
//!
//! 最小命令行工具：发现控制板，依次把一个通道移动到给定位置。
//!
//! ```bash
//! # 唯一一块控制板，通道 0，默认位置序列 0.0 0.5 1.0 0.5
//! servomaster-cli
//!
//! # 指定序列号和通道，缓慢移动
//! servomaster-cli --serial 31337 --channel 2 --crawl 0.25 0.75
//!
//! # 从配置文件加载脉宽范围与过渡参数
//! servomaster-cli --config servomaster.toml --metrics 1.0
//! ```
//!
//! 成功时退出码为 0；任何一步失败时向 stderr 输出 `error: <message>` 并以 1 退出。

use anyhow::{Context, Result};
use clap::Parser;
use servomaster_driver::{
    ControllerConfig, CrawlTransitionController, ServoController, ServoControllerBuilder,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 过渡等待上限
const TRANSITION_TIMEOUT: Duration = Duration::from_secs(30);

/// Servomaster CLI - USB 舵机控制板命令行工具
#[derive(Parser, Debug)]
#[command(name = "servomaster-cli")]
#[command(about = "Drive one channel of a USB servo controller board", long_about = None)]
#[command(version)]
struct Cli {
    /// 控制板序列号（总线上只有一块时可省略）
    #[arg(short, long)]
    serial: Option<String>,

    /// 通道号
    #[arg(short, long, default_value_t = 0)]
    channel: usize,

    /// 配置文件（TOML）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 使用爬行过渡缓慢移动
    #[arg(long)]
    crawl: bool,

    /// 结束时以 JSON 输出指标快照
    #[arg(long)]
    metrics: bool,

    /// 依次移动到的位置（0.0 ~ 1.0）
    #[arg(allow_negative_numbers = true, default_values_t = [0.0, 0.5, 1.0, 0.5])]
    positions: Vec<f64>,
}

impl Cli {
    fn load_config(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ControllerConfig::default(),
        };

        if let Some(serial) = &self.serial {
            config.serial = Some(serial.clone());
        }
        Ok(config)
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    let crawl = CrawlTransitionController::from_config(&config.transition);

    let controller: ServoController = ServoControllerBuilder::new().config(config).build()?;
    controller.init(None)?;

    let meta = controller.meta()?;
    info!(
        "Using {} {} with {} channels",
        meta.manufacturer, meta.model, meta.channel_count
    );

    let servo = controller.get_servo(cli.channel)?;
    if cli.crawl {
        servo.attach(Arc::new(crawl))?;
    }

    for &position in &cli.positions {
        info!("Channel {} => {:.3}", cli.channel, position);
        servo.set_position(position)?;

        if cli.crawl && !servo.wait_for_transition(TRANSITION_TIMEOUT) {
            anyhow::bail!("transition to {} did not finish in time", position);
        }
    }

    if cli.metrics {
        let snapshot = controller.metrics().snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    controller.close();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("servomaster=info")),
        )
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_arguments() {
        let cli = Cli::try_parse_from(["servomaster-cli"]).unwrap();

        assert_eq!(cli.serial, None);
        assert_eq!(cli.channel, 0);
        assert!(!cli.crawl);
        assert_eq!(cli.positions, vec![0.0, 0.5, 1.0, 0.5]);
    }

    #[test]
    fn test_explicit_arguments() {
        let cli = Cli::try_parse_from([
            "servomaster-cli",
            "--serial",
            "31337",
            "-c",
            "3",
            "--crawl",
            "0.25",
            "1",
        ])
        .unwrap();

        assert_eq!(cli.serial.as_deref(), Some("31337"));
        assert_eq!(cli.channel, 3);
        assert!(cli.crawl);
        assert_eq!(cli.positions, vec![0.25, 1.0]);
    }

    #[test]
    fn test_serial_overrides_config() {
        let cli = Cli::try_parse_from(["servomaster-cli", "-s", "7"]).unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.serial.as_deref(), Some("7"));
    }

    #[test]
    fn test_missing_config_file() {
        let cli =
            Cli::try_parse_from(["servomaster-cli", "--config", "/nonexistent/servomaster.toml"])
                .unwrap();
        let error = cli.load_config().unwrap_err();
        assert!(format!("{:#}", error).contains("servomaster.toml"));
    }
}
