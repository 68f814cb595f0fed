//! # Rover MQTT Client
//!
//! 边缘桥接使用的 MQTT 客户端层。
//!
//! - `BrokerSession` / `BrokerConnector`: broker 会话统一接口
//! - `config`: 连接参数与 rumqttc 后端
//! - `payload`: 载荷类型与按类型分发的订阅回调
//! - `client`: `MqttClient`，管理会话生命周期、重连重订阅与按主题的周期发布线程
//! - `mock`: 内存 broker（`mock` feature 或测试时可用）

use crossbeam_channel::Sender;
use std::time::Duration;
use thiserror::Error;

pub mod client;
pub mod config;
pub mod payload;


#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{ClientTiming, MqttClient};
pub use config::MqttConfig;
pub use payload::{CallbackRegistry, MessageCallback, MessageKind, Payload};

#[cfg(any(test, feature = "mock"))]
pub use mock::MockBroker;

/// MQTT 层统一错误类型
#[derive(Error, Debug)]
pub enum MqttError {
    #[error("Not connected to MQTT broker")]
    NotConnected,
    #[error("Connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("No acknowledgement from broker within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Client request failed: {0}")]
    Client(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// broker 会话事件，由后端网络线程产生
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// 收到 CONNACK（首次连接或自动重连）
    Connected,
    /// 连接断开或被拒绝
    Disconnected(String),
    /// 入站消息
    Message { topic: String, payload: Vec<u8> },
}

/// 已建立的 broker 会话
///
/// 方法只负责把请求交给后端，不等待 broker 确认。
pub trait BrokerSession: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    fn subscribe(&self, topic: &str) -> Result<(), MqttError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// 关闭会话并停止后端网络线程
    fn disconnect(&self) -> Result<(), MqttError>;
}

pub type BoxedSession = Box<dyn BrokerSession>;

/// 会话工厂
///
/// `open` 启动后端并返回会话；连接结果通过 `events` 异步报告
/// （`BrokerEvent::Connected` 或 `BrokerEvent::Disconnected`）。
pub trait BrokerConnector: Send + Sync {
    fn open(&self, events: Sender<BrokerEvent>) -> Result<BoxedSession, MqttError>;

    /// 人类可读的 broker 描述（用于状态字符串和日志）
    fn describe(&self) -> String;
}
