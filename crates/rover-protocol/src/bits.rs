//! 位域读写与 BCC 校验
//!
//! 8 字节负载按小端整数处理：`u64::from_le_bytes(data)` 的 bit N
//! 就是位流中的第 N 位（byte 0 的 LSB 为 bit 0）。

/// 从位流中读取 `length` 位（LSB 优先，可跨字节）
///
/// `signed` 为 true 且最高位为 1 时按 `length` 位补码做符号扩展。
/// `length` 为 0 时返回 0。
///
/// # 示例
///
/// ```rust
/// use rover_protocol::get_bits;
///
/// let data = [0xF0, 0xFF, 0, 0, 0, 0, 0, 0];
/// assert_eq!(get_bits(&data, 4, 12, false), 0xFFF);
/// assert_eq!(get_bits(&data, 4, 12, true), -1);
/// ```
pub fn get_bits(data: &[u8; 8], start: u32, length: u32, signed: bool) -> i64 {
    if length == 0 || start >= 64 {
        return 0;
    }
    let length = length.min(64 - start);
    let raw = u64::from_le_bytes(*data) >> start;
    let value = raw & mask(length);

    if signed && length < 64 && (value >> (length - 1)) & 1 == 1 {
        (value | !mask(length)) as i64
    } else {
        value as i64
    }
}

/// 向位流写入 `length` 位，超出宽度的高位被截断（负数写入其补码低位）
pub fn set_bits(data: &mut [u8; 8], start: u32, length: u32, value: i64) {
    if length == 0 || start >= 64 {
        return;
    }
    let length = length.min(64 - start);
    let m = mask(length) << start;
    let word = u64::from_le_bytes(*data);
    let word = (word & !m) | (((value as u64) << start) & m);
    *data = word.to_le_bytes();
}

/// BCC：byte 0..=6 逐字节异或
pub fn bcc(data: &[u8; 8]) -> u8 {
    data[..7].iter().fold(0, |acc, b| acc ^ b)
}

fn mask(length: u32) -> u64 {
    if length >= 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    }
}

/// 定点信号描述：起始位、位宽、有无符号、缩放系数
///
/// 物理值 = 原始值 × `scale`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub start: u32,
    pub length: u32,
    pub signed: bool,
    pub scale: f64,
}

impl Signal {
    pub const fn unsigned(start: u32, length: u32, scale: f64) -> Self {
        Self {
            start,
            length,
            signed: false,
            scale,
        }
    }

    pub const fn signed(start: u32, length: u32, scale: f64) -> Self {
        Self {
            start,
            length,
            signed: true,
            scale,
        }
    }

    /// 原始值允许范围
    pub fn raw_range(&self) -> (i64, i64) {
        if self.signed {
            let half = 1i64 << (self.length - 1);
            (-half, half - 1)
        } else {
            (0, mask(self.length) as i64)
        }
    }

    pub fn read_raw(&self, data: &[u8; 8]) -> i64 {
        get_bits(data, self.start, self.length, self.signed)
    }

    /// 读取并换算为物理值
    pub fn read(&self, data: &[u8; 8]) -> f64 {
        self.read_raw(data) as f64 * self.scale
    }

    /// 物理值四舍五入到最近的原始值，超出位宽时饱和到边界
    pub fn to_raw(&self, value: f64) -> i64 {
        let (min, max) = self.raw_range();
        if value.is_nan() {
            return 0;
        }
        let raw = (value / self.scale).round();
        if raw <= min as f64 {
            min
        } else if raw >= max as f64 {
            max
        } else {
            raw as i64
        }
    }

    pub fn write(&self, data: &mut [u8; 8], value: f64) {
        set_bits(data, self.start, self.length, self.to_raw(value));
    }

    pub fn write_raw(&self, data: &mut [u8; 8], raw: i64) {
        set_bits(data, self.start, self.length, raw);
    }
}
