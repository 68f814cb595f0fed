//! # Rover Protocol
//!
//! 底盘 CAN 总线协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `ids`: CAN ID 常量定义
//! - `bits`: 位域读写、定点缩放与 BCC 校验
//! - `counter`: 心跳计数器（Alive Rolling Counter）
//! - `gear`: 档位定义
//! - `message`: 报文布局抽象（计数器、BCC 位置）
//! - `control`: 控制帧编码
//! - `feedback`: 反馈帧解码
//!
//! ## 字节序
//!
//! 所有报文均为 Intel（LSB）低位在前的位流：bit 0 是 byte 0 的最低位，
//! 信号可以跨字节边界。

pub mod bits;
pub mod control;
pub mod counter;
pub mod feedback;
pub mod gear;
pub mod ids;
pub mod message;

// 重新导出常用类型
pub use bits::{Signal, bcc, get_bits, set_bits};
pub use control::*;
pub use counter::{RollingCounter, SequenceTracker};
pub use feedback::*;
pub use gear::Gear;
pub use ids::*;
pub use message::MessageLayout;

use thiserror::Error;

/// CAN 2.0 帧的统一抽象
///
/// 协议层与硬件层之间的中间类型：编码器产出 `RoverFrame`，
/// 传输层负责把它转换为具体后端（SocketCAN、Mock）的帧类型。
///
/// ```text
/// Protocol Layer (rover-protocol)
///     ↓ FrameEncoder::encode() / FrameDecoder::decode()
/// RoverFrame (此类型)
///     ↓ 转换逻辑在 CAN 层实现
/// CAN Layer (rover-can)
/// ```
///
/// # 示例
///
/// ```rust
/// use rover_protocol::RoverFrame;
///
/// let frame = RoverFrame::new_extended(0x18C4D1D0, &[1, 2, 3, 4, 5, 6, 7, 8]);
/// assert!(frame.is_extended);
/// assert_eq!(frame.data_slice().len(), 8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoverFrame {
    /// 仲裁 ID（标准帧 11 bit 或扩展帧 29 bit）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,

    /// 接收时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl RoverFrame {
    /// 29-bit 扩展 ID 掩码
    pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32 & 0x7FF, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id & Self::EXTENDED_ID_MASK, data, true)
    }

    /// 通用构造器
    pub fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
            timestamp_us: 0,
        }
    }

    /// 附加接收时间戳
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 获取完整数据（8字节固定数组）
    pub fn data(&self) -> &[u8; 8] {
        &self.data
    }
}

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid CAN ID: 0x{id:X} (expected 0x{expected:X})")]
    InvalidCanId { id: u32, expected: u32 },
}
