//! 控制帧编码
//!
//! 上位机下发的两类运动指令，以及带心跳计数器的编码器。

use std::marker::PhantomData;

use crate::bits::{Signal, bcc};
use crate::counter::RollingCounter;
use crate::gear::Gear;
use crate::ids::{ID_CTRL_CMD, ID_STEERING_CTRL_CMD};
use crate::message::{BCC_BYTE, COUNTER, MessageLayout};
use crate::RoverFrame;

/// 档位 @0, 4 bit
pub const GEAR: Signal = Signal::unsigned(0, 4, 1.0);
/// 线速度 @4, 16 bit, 0.001 m/s
pub const SPEED: Signal = Signal::signed(4, 16, 0.001);
/// 角速度 / 转向角 @20, 16 bit, 0.01
pub const ANGLE: Signal = Signal::signed(20, 16, 0.01);
/// 侧偏角 @36, 16 bit, 0.01°
pub const SIDE_SLIP: Signal = Signal::signed(36, 16, 0.01);

pub(crate) fn write_gear(data: &mut [u8; 8], gear: Gear) {
    GEAR.write_raw(data, i64::from(gear.raw() & 0x0F));
}

pub(crate) fn read_gear(data: &[u8; 8]) -> Gear {
    Gear::from(GEAR.read_raw(data) as u8)
}

// ============================================================================
// 运动控制指令
// ============================================================================

/// 运动控制指令 ctrl_cmd (0x18C4D1D0)
///
/// | 信号 | 起始位 | 位宽 | 符号 | 单位 |
/// |---|---|---|---|---|
/// | gear | 0 | 4 | u | - |
/// | speed | 4 | 16 | s | 0.001 m/s |
/// | angular_velocity | 20 | 16 | s | 0.01 °/s |
/// | side_slip | 36 | 16 | s | 0.01 ° |
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CtrlCmd {
    pub gear: Gear,
    pub speed: f64,
    pub angular_velocity: f64,
    pub side_slip: f64,
}

impl CtrlCmd {
    pub fn new(gear: Gear, speed: f64, angular_velocity: f64, side_slip: f64) -> Self {
        Self {
            gear,
            speed,
            angular_velocity,
            side_slip,
        }
    }
}

impl MessageLayout for CtrlCmd {
    const ID: u32 = ID_CTRL_CMD;
    const NAME: &'static str = "ctrl_cmd";

    fn write_signals(&self, data: &mut [u8; 8]) {
        write_gear(data, self.gear);
        SPEED.write(data, self.speed);
        ANGLE.write(data, self.angular_velocity);
        SIDE_SLIP.write(data, self.side_slip);
    }

    fn read_signals(data: &[u8; 8]) -> Self {
        Self {
            gear: read_gear(data),
            speed: SPEED.read(data),
            angular_velocity: ANGLE.read(data),
            side_slip: SIDE_SLIP.read(data),
        }
    }
}

/// 转向控制指令 steering_ctrl_cmd (0x18C4D2D0)
///
/// 布局同 `CtrlCmd`，bit 20 处为转向角（0.01°）。
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SteeringCtrlCmd {
    pub gear: Gear,
    pub speed: f64,
    pub steer: f64,
    pub side_slip: f64,
}

impl SteeringCtrlCmd {
    pub fn new(gear: Gear, speed: f64, steer: f64, side_slip: f64) -> Self {
        Self {
            gear,
            speed,
            steer,
            side_slip,
        }
    }
}

impl MessageLayout for SteeringCtrlCmd {
    const ID: u32 = ID_STEERING_CTRL_CMD;
    const NAME: &'static str = "steering_ctrl_cmd";

    fn write_signals(&self, data: &mut [u8; 8]) {
        write_gear(data, self.gear);
        SPEED.write(data, self.speed);
        ANGLE.write(data, self.steer);
        SIDE_SLIP.write(data, self.side_slip);
    }

    fn read_signals(data: &[u8; 8]) -> Self {
        Self {
            gear: read_gear(data),
            speed: SPEED.read(data),
            steer: ANGLE.read(data),
            side_slip: SIDE_SLIP.read(data),
        }
    }
}

// ============================================================================
// 编码器
// ============================================================================

/// 带心跳计数器的报文编码器
///
/// 每次 `encode` 写入信号、当前计数值和 BCC，然后计数器加一（模 16）。
/// 同一路报文的所有发送路径应共用一个编码器实例，否则计数会重复。
///
/// # 示例
///
/// ```rust
/// use rover_protocol::{CtrlCmd, CtrlCmdEncoder, Gear, bcc};
///
/// let mut encoder = CtrlCmdEncoder::new();
/// let frame = encoder.encode(&CtrlCmd::new(Gear::Park, 0.0, 0.0, 0.0));
/// assert_eq!(frame.data[7], bcc(&frame.data));
/// assert_eq!(encoder.next_counter(), 1);
/// ```
#[derive(Debug)]
pub struct FrameEncoder<M> {
    counter: RollingCounter,
    _message: PhantomData<fn(&M)>,
}

pub type CtrlCmdEncoder = FrameEncoder<CtrlCmd>;
pub type SteeringCtrlCmdEncoder = FrameEncoder<SteeringCtrlCmd>;

impl<M: MessageLayout> Default for FrameEncoder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MessageLayout> FrameEncoder<M> {
    pub fn new() -> Self {
        Self {
            counter: RollingCounter::new(),
            _message: PhantomData,
        }
    }

    /// 下一帧的计数值
    pub fn next_counter(&self) -> u8 {
        self.counter.peek()
    }

    pub fn encode(&mut self, message: &M) -> RoverFrame {
        let mut data = [0u8; 8];
        message.write_signals(&mut data);
        COUNTER.write_raw(&mut data, i64::from(self.counter.advance()));
        data[BCC_BYTE] = bcc(&data);
        RoverFrame::new_extended(M::ID, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::get_bits;

    #[test]
    fn test_ctrl_cmd_layout() {
        let mut encoder = CtrlCmdEncoder::new();
        let frame = encoder.encode(&CtrlCmd::new(Gear::FourSteerFourDrive, 0.5, 10.0, -2.0));

        assert_eq!(frame.id, ID_CTRL_CMD);
        assert!(frame.is_extended);
        assert_eq!(frame.len, 8);
        assert_eq!(get_bits(&frame.data, 0, 4, false), 6);
        assert_eq!(get_bits(&frame.data, 4, 16, true), 500);
        assert_eq!(get_bits(&frame.data, 20, 16, true), 1000);
        assert_eq!(get_bits(&frame.data, 36, 16, true), -200);
        assert_eq!(get_bits(&frame.data, 52, 4, false), 0);
        assert_eq!(frame.data[7], bcc(&frame.data));
    }

    #[test]
    fn test_ctrl_cmd_neutral_frame() {
        let mut encoder = CtrlCmdEncoder::new();
        let frame = encoder.encode(&CtrlCmd::default());
        assert_eq!(frame.data, [0u8; 8]);

        let frame = encoder.encode(&CtrlCmd::default());
        // 计数器 1 落在 byte 6 的高半字节
        assert_eq!(frame.data[6], 0x10);
        assert_eq!(frame.data[7], 0x10);
    }

    #[test]
    fn test_encoder_counter_sequence() {
        let mut encoder = SteeringCtrlCmdEncoder::new();
        let cmd = SteeringCtrlCmd::new(Gear::Crab, -0.25, 15.5, 0.0);
        for i in 0..40u32 {
            let frame = encoder.encode(&cmd);
            assert_eq!(get_bits(&frame.data, 52, 4, false), i64::from(i % 16));
        }
    }

    #[test]
    fn test_steering_cmd_id_and_steer() {
        let mut encoder = SteeringCtrlCmdEncoder::new();
        let frame = encoder.encode(&SteeringCtrlCmd::new(Gear::Neutral, 0.0, -30.0, 0.0));
        assert_eq!(frame.id, ID_STEERING_CTRL_CMD);
        assert_eq!(get_bits(&frame.data, 20, 16, true), -3000);
    }

    #[test]
    fn test_unknown_gear_is_masked_to_four_bits() {
        let mut encoder = CtrlCmdEncoder::new();
        let frame = encoder.encode(&CtrlCmd::new(Gear::Unknown(0x1B), 0.0, 0.0, 0.0));
        assert_eq!(get_bits(&frame.data, 0, 4, false), 0x0B);
        assert_eq!(get_bits(&frame.data, 4, 16, false), 0);
    }

    #[test]
    fn test_out_of_range_speed_saturates() {
        let mut encoder = CtrlCmdEncoder::new();
        let frame = encoder.encode(&CtrlCmd::new(Gear::Park, 100.0, 0.0, 0.0));
        assert_eq!(get_bits(&frame.data, 4, 16, true), i64::from(i16::MAX));
    }
}
