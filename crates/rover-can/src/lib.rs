//! # Rover CAN Transport
//!
//! CAN 硬件抽象层与传输层。
//!
//! - `CanAdapter` / `RxAdapter` / `TxAdapter`: 后端统一接口
//! - `socketcan`: Linux SocketCAN 后端（含接口 bring-up）
//! - `gs_usb`: GS-USB / candleLight USB 后端（`gs_usb` feature）
//! - `config`: 后端选择与打开
//! - `hooks`: 接收帧处理器注册表
//! - `transport`: `CanTransport`，管理连接生命周期、接收线程与周期发送线程
//! - `mock`: 内存总线（`mock` feature 或测试时可用）

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use rover_protocol::RoverFrame;

pub mod config;
pub mod hooks;
pub mod join;
pub mod transport;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(feature = "gs_usb")]
pub mod gs_usb;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{CanBackend, CanConfig};
pub use hooks::{FrameHandler, HandlerError, HandlerRegistry};
pub use join::{JoinError, JoinTimeout};
pub use transport::{CanTransport, FrameSource, TransportTiming};

#[cfg(target_os = "linux")]
pub use socketcan::{SocketCanAdapter, SocketCanRxAdapter, SocketCanTxAdapter};

#[cfg(feature = "gs_usb")]
pub use gs_usb::{GsUsbAdapter, GsUsbRxAdapter, GsUsbTxAdapter};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockCanAdapter, MockCanBus};

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Read timeout")]
    Timeout,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
    #[error("Interface bring-up failed: {0}")]
    BringUp(String),
}

impl CanError {
    /// 接收线程遇到此类错误时退出并标记断开
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::Device(e) => e.is_fatal(),
            CanError::BusOff | CanError::NotStarted => true,
            _ => false,
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NoDevice
                | CanDeviceErrorKind::AccessDenied
                | CanDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

/// 未分离的完整适配器
pub trait CanAdapter {
    fn send(&mut self, frame: RoverFrame) -> Result<(), CanError>;

    /// 阻塞接收，超过读超时返回 `CanError::Timeout`
    fn receive(&mut self) -> Result<RoverFrame, CanError>;

    fn set_receive_timeout(&mut self, _timeout: Duration) {}

    fn receive_timeout(&mut self, timeout: Duration) -> Result<RoverFrame, CanError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }

    fn send_timeout(&mut self, frame: RoverFrame, _timeout: Duration) -> Result<(), CanError> {
        self.send(frame)
    }
}

/// 只读半边（接收线程持有）
pub trait RxAdapter: Send {
    fn receive(&mut self) -> Result<RoverFrame, CanError>;

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), CanError>;

    fn receive_timeout(&mut self, timeout: Duration) -> Result<RoverFrame, CanError> {
        self.set_receive_timeout(timeout)?;
        self.receive()
    }
}

/// 只写半边（发送路径共享）
pub trait TxAdapter: Send {
    fn send(&mut self, frame: RoverFrame) -> Result<(), CanError>;

    fn send_timeout(&mut self, frame: RoverFrame, _timeout: Duration) -> Result<(), CanError> {
        self.send(frame)
    }
}

/// 可分离为独立 RX/TX 的适配器
pub trait SplittableAdapter: CanAdapter {
    type RxAdapter: RxAdapter + 'static;
    type TxAdapter: TxAdapter + 'static;

    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError>;
}

pub type BoxedRxAdapter = Box<dyn RxAdapter>;
pub type BoxedTxAdapter = Box<dyn TxAdapter>;

/// 打开总线并返回已分离的两半
///
/// `CanTransport::connect` 每次调用一次；失败时不得留下已打开的资源。
pub trait AdapterFactory: Send + Sync {
    fn open(&self) -> Result<(BoxedRxAdapter, BoxedTxAdapter), CanError>;

    /// 用于状态描述与日志
    fn describe(&self) -> String;
}

/// 主机侧接收时间戳（微秒）
#[cfg_attr(not(any(target_os = "linux", feature = "gs_usb")), allow(dead_code))]
pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// 分离后装箱
pub fn split_boxed<A: SplittableAdapter>(
    adapter: A,
) -> Result<(BoxedRxAdapter, BoxedTxAdapter), CanError> {
    let (rx, tx) = adapter.split()?;
    Ok((Box::new(rx), Box::new(tx)))
}
