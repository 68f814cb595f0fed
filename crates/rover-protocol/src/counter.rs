//! 心跳计数器
//!
//! 4-bit，取值 0..=15。发送端每帧加一，接收端校验连续性。

/// 计数器取模
pub const COUNTER_MODULO: u8 = 16;

/// 发送端计数器，从 0 开始
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingCounter {
    value: u8,
}

impl RollingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 下一帧将使用的计数值
    pub fn peek(&self) -> u8 {
        self.value
    }

    /// 返回当前值并前进一步
    pub fn advance(&mut self) -> u8 {
        let current = self.value;
        self.value = (self.value + 1) % COUNTER_MODULO;
        current
    }
}

/// 接收端连续性检查
///
/// 首帧恒为连续；之后要求 `received == (last + 1) % 16`。
/// 无论是否连续，`last` 都更新为本帧计数值。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    last: Option<u8>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    /// 记录一帧计数值，返回是否连续
    pub fn observe(&mut self, counter: u8) -> bool {
        let counter = counter % COUNTER_MODULO;
        let ok = match self.last {
            None => true,
            Some(last) => counter == (last + 1) % COUNTER_MODULO,
        };
        self.last = Some(counter);
        ok
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
