//! 边缘控制器主入口
//!
//! 订阅 `ROBOT/{id}/Control`，把控制命令以 20 ms 周期下发到底盘 CAN 总线，
//! 同时把底盘反馈汇总后发布到 `ROBOT/{id}/Status`。
//!
//! ```bash
//! edge-controller --config edge.toml
//! edge-controller --robot-id 02 --mqtt-host 192.168.12.117 --can-channel can1
//! ```

mod logging;

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use rover_bridge::{BridgeConfig, ControlBridge};
use tracing::{error, info};

/// MQTT ↔ CAN 边缘控制器
#[derive(Parser, Debug)]
#[command(name = "edge-controller")]
#[command(about = "Edge controller - bridges MQTT control topics to the rover CAN bus")]
#[command(version)]
struct Args {
    /// TOML 配置文件；缺省时使用内置默认值
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 机器人 ID（两位数字，如 01）
    #[arg(long)]
    robot_id: Option<String>,

    /// MQTT broker 地址
    #[arg(long)]
    mqtt_host: Option<String>,

    /// MQTT broker 端口
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// CAN 接口名（如 can0）
    #[arg(long)]
    can_channel: Option<String>,

    /// 日志过滤规则（如 info 或 rover_can=debug），优先于 RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// 日志文件目录
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// 只输出到控制台
    #[arg(long)]
    no_log_file: bool,
}

/// 配置文件 + 命令行覆盖
fn build_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    if let Some(robot_id) = &args.robot_id {
        config.robot_id = robot_id.clone();
    }
    if let Some(host) = &args.mqtt_host {
        config.mqtt.host = host.clone();
    }
    if let Some(port) = args.mqtt_port {
        config.mqtt.port = port;
    }
    if let Some(channel) = &args.can_channel {
        config.can.channel = channel.clone();
    }

    config.validate()?;
    Ok(config)
}

fn main() {
    let args = Args::parse();

    let log_dir = (!args.no_log_file).then_some(args.log_dir.as_path());
    let _log_guard = match logging::init(args.log_level.as_deref(), log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            process::exit(1);
        },
    };

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            process::exit(1);
        },
    };

    info!(
        "Edge controller starting: robot {}, MQTT {}:{}, CAN {} ({})",
        config.robot_id,
        config.mqtt.host,
        config.mqtt.port,
        config.can.channel,
        config.can.backend.as_str()
    );

    let bridge = ControlBridge::new(config);

    // 信号处理只置位停止标志，停止流程由 run() 在主线程执行
    let shutdown = bridge.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal. Shutting down...");
        shutdown.request();
    }) {
        error!("Failed to set signal handler: {}", e);
        process::exit(1);
    }

    info!("Press Ctrl+C to stop.");
    if let Err(e) = bridge.run() {
        error!("Edge controller failed to start: {}", e);
        process::exit(1);
    }
    info!("Edge controller exited cleanly");
}
