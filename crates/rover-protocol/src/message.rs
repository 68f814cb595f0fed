//! 报文布局抽象
//!
//! 所有底盘报文共用同一骨架：信号位于 byte 0..=6，计数器位于 bit 52..56，
//! BCC 位于 byte 7。具体报文只描述自己的信号。

use crate::bits::Signal;
use crate::{ProtocolError, RoverFrame};

/// 心跳计数器 @52, 4 bit
pub const COUNTER: Signal = Signal::unsigned(52, 4, 1.0);

/// BCC 所在字节
pub const BCC_BYTE: usize = 7;

/// 报文数据长度
pub const FRAME_LEN: usize = 8;

/// 单个报文的信号布局
pub trait MessageLayout: Sized {
    /// 仲裁 ID（扩展帧）
    const ID: u32;

    /// 报文名，用于日志
    const NAME: &'static str;

    /// 写入信号（不含计数器与 BCC）
    fn write_signals(&self, data: &mut [u8; 8]);

    /// 读取信号（不含计数器与 BCC）
    fn read_signals(data: &[u8; 8]) -> Self;

    /// 校验 ID 与长度后解析
    fn from_frame(frame: &RoverFrame) -> Result<Self, ProtocolError> {
        if frame.id != Self::ID {
            return Err(ProtocolError::InvalidCanId {
                id: frame.id,
                expected: Self::ID,
            });
        }
        if (frame.len as usize) < FRAME_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: FRAME_LEN,
                actual: frame.len as usize,
            });
        }
        Ok(Self::read_signals(&frame.data))
    }
}
