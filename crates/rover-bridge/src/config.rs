//! 桥接配置（TOML）
//!
//! ```toml
//! robot_id = "01"
//! frame_policy = "always_apply"
//!
//! [mqtt]
//! host = "192.168.12.117"
//! port = 1883
//!
//! [can]
//! backend = "socketcan"
//! channel = "can0"
//! bitrate = 500000
//! # backend = "gs_usb" 时可选：serial_number = "004A0033"
//!
//! [timing]
//! can_send_interval_ms = 20
//! status_publish_interval_ms = 500
//! ```
//!
//! 缺失的键使用默认值。

use std::path::Path;
use std::time::Duration;

use rover_can::{CanConfig, TransportTiming};
use rover_mqtt::{ClientTiming, MqttConfig};
use serde::{Deserialize, Serialize};

use crate::BridgeError;
use crate::telemetry::FramePolicy;

/// 周期与超时（毫秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub can_send_interval_ms: u64,
    pub status_publish_interval_ms: u64,
    /// 主循环检查停止请求的间隔
    pub idle_poll_ms: u64,
    pub can_receive_timeout_ms: u64,
    pub can_send_timeout_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            can_send_interval_ms: 20,
            status_publish_interval_ms: 500,
            idle_poll_ms: 100,
            can_receive_timeout_ms: 100,
            can_send_timeout_ms: 20,
            join_timeout_ms: 2000,
        }
    }
}

impl TimingConfig {
    pub fn can_send_interval(&self) -> Duration {
        Duration::from_millis(self.can_send_interval_ms)
    }

    pub fn status_publish_interval(&self) -> Duration {
        Duration::from_millis(self.status_publish_interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn transport_timing(&self) -> TransportTiming {
        TransportTiming {
            receive_timeout: Duration::from_millis(self.can_receive_timeout_ms),
            send_timeout: Duration::from_millis(self.can_send_timeout_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
        }
    }

    pub fn client_timing(&self, connect_timeout: Duration) -> ClientTiming {
        ClientTiming {
            connect_timeout,
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            ..ClientTiming::default()
        }
    }
}

/// 桥接配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// 两位数字的机器人 ID
    pub robot_id: String,
    pub frame_policy: FramePolicy,
    pub mqtt: MqttConfig,
    pub can: CanConfig,
    pub timing: TimingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            robot_id: "01".to_string(),
            frame_policy: FramePolicy::AlwaysApply,
            mqtt: MqttConfig::default(),
            can: CanConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn new(robot_id: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            ..Self::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, BridgeError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.robot_id.is_empty() {
            return Err(BridgeError::InvalidConfig("robot_id must not be empty".into()));
        }
        if self.can.channel.is_empty() {
            return Err(BridgeError::InvalidConfig("can.channel must not be empty".into()));
        }
        let t = &self.timing;
        for (name, value) in [
            ("can_send_interval_ms", t.can_send_interval_ms),
            ("status_publish_interval_ms", t.status_publish_interval_ms),
            ("idle_poll_ms", t.idle_poll_ms),
            ("can_receive_timeout_ms", t.can_receive_timeout_ms),
        ] {
            if value == 0 {
                return Err(BridgeError::InvalidConfig(format!(
                    "timing.{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }

    /// MQTT 参数；未配置 client id 时使用 `Robot_{robot_id}`
    pub fn mqtt_config(&self) -> MqttConfig {
        let mut mqtt = self.mqtt.clone();
        if mqtt.client_id.is_none() {
            mqtt.client_id = Some(format!("Robot_{}", self.robot_id));
        }
        mqtt
    }
}
