//! # Rover Edge Bridge
//!
//! 单台机器人的 MQTT ↔ CAN 桥接：
//!
//! ```text
//! ROBOT/{id}/Control ──json──> ControlBridge.command ──20ms──> CAN 0x18C4D1D0
//! CAN feedback ──decode──> ControlBridge.status ──500ms──> ROBOT/{id}/Status
//! ```
//!
//! - `command` / `status`: MQTT JSON 载荷
//! - `topics`: 主题命名
//! - `telemetry`: 每种反馈帧一个解码器，按策略合并进状态
//! - `config`: TOML 配置
//! - `bridge`: `ControlBridge`，启动/停止流程与两条数据通路

use std::path::PathBuf;
use thiserror::Error;

pub mod bridge;
pub mod command;
pub mod config;
pub mod status;
pub mod telemetry;
pub mod topics;

pub use bridge::{ControlBridge, ControlOutcome, ShutdownHandle};
pub use command::ControlCommand;
pub use config::{BridgeConfig, TimingConfig};
pub use status::RobotStatus;
pub use telemetry::{FrameOutcome, FramePolicy, TelemetryDecoders};
pub use topics::{control_topic, status_topic};

/// 桥接层错误类型
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("MQTT connection failed: {0}")]
    MqttConnect(String),
    #[error("Failed to subscribe to control topic '{0}'")]
    Subscribe(String),
    #[error("CAN connection failed: {0}")]
    CanConnect(String),
    #[error("Failed to start periodic CAN send")]
    PeriodicSend,
    #[error("Failed to start status publishing on '{0}'")]
    StatusPublish(String),
    #[error("Failed to read config file {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
