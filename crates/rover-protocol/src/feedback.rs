//! 反馈帧解码
//!
//! 底盘上报的四类反馈报文，以及带 BCC / 计数器校验的有状态解码器。

use std::marker::PhantomData;

use crate::bits::{Signal, bcc};
use crate::control::{ANGLE, SIDE_SLIP, SPEED, read_gear, write_gear};
use crate::counter::SequenceTracker;
use crate::gear::Gear;
use crate::ids::*;
use crate::message::{BCC_BYTE, COUNTER, MessageLayout};
use crate::{ProtocolError, RoverFrame};

// ============================================================================
// 运动反馈
// ============================================================================

/// 转向控制反馈 steering_ctrl_fb (0x18C4D2EF)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SteeringCtrlFeedback {
    pub gear: Gear,
    /// m/s
    pub speed: f64,
    /// °
    pub steer: f64,
    /// °
    pub side_slip: f64,
}

impl MessageLayout for SteeringCtrlFeedback {
    const ID: u32 = ID_STEERING_CTRL_FB;
    const NAME: &'static str = "steering_ctrl_fb";

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

/// 控制反馈 ctrl_fb (0x18C4D1EF)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CtrlFeedback {
    pub gear: Gear,
    /// m/s
    pub linear_velocity: f64,
    /// °/s
    pub angular_velocity: f64,
    /// °
    pub side_slip: f64,
}

impl MessageLayout for CtrlFeedback {
    const ID: u32 = ID_CTRL_FB;
    const NAME: &'static str = "ctrl_fb";

    fn write_signals(&self, data: &mut [u8; 8]) {
        write_gear(data, self.gear);
        SPEED.write(data, self.linear_velocity);
        ANGLE.write(data, self.angular_velocity);
        SIDE_SLIP.write(data, self.side_slip);
    }

    fn read_signals(data: &[u8; 8]) -> Self {
        Self {
            gear: read_gear(data),
            linear_velocity: SPEED.read(data),
            angular_velocity: ANGLE.read(data),
            side_slip: SIDE_SLIP.read(data),
        }
    }
}

// ============================================================================
// 电池反馈
// ============================================================================

const BMS_VOLTAGE: Signal = Signal::unsigned(0, 16, 0.01);
const BMS_CURRENT: Signal = Signal::signed(16, 16, 0.01);
const BMS_REMAINING_CAPACITY: Signal = Signal::unsigned(32, 16, 0.01);

/// BMS 反馈 bms_fb (0x18C4E1EF)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BmsFeedback {
    /// V
    pub voltage: f64,
    /// A，放电为负
    pub current: f64,
    /// Ah
    pub remaining_capacity: f64,
}

impl MessageLayout for BmsFeedback {
    const ID: u32 = ID_BMS_FB;
    const NAME: &'static str = "bms_fb";

    fn write_signals(&self, data: &mut [u8; 8]) {
        BMS_VOLTAGE.write(data, self.voltage);
        BMS_CURRENT.write(data, self.current);
        BMS_REMAINING_CAPACITY.write(data, self.remaining_capacity);
    }

    fn read_signals(data: &[u8; 8]) -> Self {
        Self {
            voltage: BMS_VOLTAGE.read(data),
            current: BMS_CURRENT.read(data),
            remaining_capacity: BMS_REMAINING_CAPACITY.read(data),
        }
    }
}

const BMS_SOC: Signal = Signal::unsigned(0, 8, 1.0);
const BMS_CHARGING: Signal = Signal::unsigned(21, 1, 1.0);
const BMS_MAX_TEMP: Signal = Signal::signed(28, 12, 0.1);
const BMS_MIN_TEMP: Signal = Signal::signed(40, 12, 0.1);

/// BMS 状态标志反馈 bms_flag_fb (0x18C4E2EF)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BmsFlagFeedback {
    /// %
    pub soc: u8,
    pub is_charging: bool,
    /// °C
    pub max_temperature: f64,
    /// °C
    pub min_temperature: f64,
}

impl MessageLayout for BmsFlagFeedback {
    const ID: u32 = ID_BMS_FLAG_FB;
    const NAME: &'static str = "bms_flag_fb";

    fn write_signals(&self, data: &mut [u8; 8]) {
        BMS_SOC.write_raw(data, i64::from(self.soc));
        BMS_CHARGING.write_raw(data, i64::from(self.is_charging));
        BMS_MAX_TEMP.write(data, self.max_temperature);
        BMS_MIN_TEMP.write(data, self.min_temperature);
    }

    fn read_signals(data: &[u8; 8]) -> Self {
        Self {
            soc: BMS_SOC.read_raw(data) as u8,
            is_charging: BMS_CHARGING.read_raw(data) == 1,
            max_temperature: BMS_MAX_TEMP.read(data),
            min_temperature: BMS_MIN_TEMP.read(data),
        }
    }
}

// ============================================================================
// 解码器
// ============================================================================

/// 一次解码的结果及校验信息
///
/// `bcc_valid` / `counter_ok` 只是附加信息，解码值总会返回，
/// 是否采用由调用方决定。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decoded<M> {
    pub message: M,
    /// 帧内心跳计数值
    pub counter: u8,
    pub bcc_valid: bool,
    pub counter_ok: bool,
    /// 接收时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl<M> Decoded<M> {
    /// BCC 与计数器均通过
    pub fn is_valid(&self) -> bool {
        self.bcc_valid && self.counter_ok
    }
}

/// 有状态解码器
///
/// 每种报文持有独立实例，计数器连续性只在同一实例内跟踪。
#[derive(Debug)]
pub struct FrameDecoder<M> {
    tracker: SequenceTracker,
    frame_count: u64,
    _message: PhantomData<fn() -> M>,
}

pub type CtrlCmdDecoder = FrameDecoder<crate::control::CtrlCmd>;
pub type CtrlFeedbackDecoder = FrameDecoder<CtrlFeedback>;
pub type SteeringCtrlFeedbackDecoder = FrameDecoder<SteeringCtrlFeedback>;
pub type BmsFeedbackDecoder = FrameDecoder<BmsFeedback>;
pub type BmsFlagFeedbackDecoder = FrameDecoder<BmsFlagFeedback>;

impl<M: MessageLayout> Default for FrameDecoder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MessageLayout> FrameDecoder<M> {
    pub fn new() -> Self {
        Self {
            tracker: SequenceTracker::new(),
            frame_count: 0,
            _message: PhantomData,
        }
    }

    /// 已成功解码的帧数
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// 上一帧计数值，未收到任何帧时为 `None`
    pub fn last_counter(&self) -> Option<u8> {
        self.tracker.last()
    }

    /// 解码一帧
    ///
    /// ID 或长度不符时返回错误，且不影响计数器跟踪状态。
    pub fn decode(&mut self, frame: &RoverFrame) -> Result<Decoded<M>, ProtocolError> {
        let message = M::from_frame(frame)?;
        let counter = COUNTER.read_raw(&frame.data) as u8;
        let bcc_valid = bcc(&frame.data) == frame.data[BCC_BYTE];
        let counter_ok = self.tracker.observe(counter);
        self.frame_count += 1;

        Ok(Decoded {
            message,
            counter,
            bcc_valid,
            counter_ok,
            timestamp_us: frame.timestamp_us,
        })
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
        self.frame_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{CtrlCmd, CtrlCmdEncoder, FrameEncoder};
    use crate::bits::set_bits;

    fn frame_with(id: u32, fill: impl FnOnce(&mut [u8; 8]), counter: u8) -> RoverFrame {
        let mut data = [0u8; 8];
        fill(&mut data);
        set_bits(&mut data, 52, 4, i64::from(counter));
        data[7] = bcc(&data);
        RoverFrame::new_extended(id, &data)
    }

    #[test]
    fn test_ctrl_cmd_scenario_decode() {
        let mut encoder = CtrlCmdEncoder::new();
        let mut decoder = CtrlCmdDecoder::new();
        let frame = encoder.encode(&CtrlCmd::new(Gear::from(6u8), 0.5, 10.0, -2.0));

        let decoded = decoder.decode(&frame).unwrap();
        assert_eq!(decoded.message.gear.label(), "6");
        assert!((decoded.message.speed - 0.5).abs() <= 0.001);
        assert!((decoded.message.angular_velocity - 10.0).abs() <= 0.01);
        assert!((decoded.message.side_slip + 2.0).abs() <= 0.01);
        assert!(decoded.bcc_valid);
        assert!(decoded.counter_ok);
        assert_eq!(decoded.counter, 0);
    }

    #[test]
    fn test_steering_feedback_signals() {
        let frame = frame_with(
            ID_STEERING_CTRL_FB,
            |d| {
                set_bits(d, 0, 4, 7);
                set_bits(d, 4, 16, -1200);
                set_bits(d, 20, 16, 2550);
                set_bits(d, 36, 16, -45);
            },
            3,
        );
        let decoded = SteeringCtrlFeedbackDecoder::new().decode(&frame).unwrap();
        assert_eq!(decoded.message.gear, Gear::Crab);
        assert!((decoded.message.speed + 1.2).abs() < 1e-9);
        assert!((decoded.message.steer - 25.5).abs() < 1e-9);
        assert!((decoded.message.side_slip + 0.45).abs() < 1e-9);
        assert_eq!(decoded.counter, 3);
    }

    #[test]
    fn test_ctrl_feedback_uses_dispatch_id() {
        let mut decoder = CtrlFeedbackDecoder::new();
        let frame = frame_with(ID_CTRL_FB, |d| set_bits(d, 4, 16, 250), 0);
        let decoded = decoder.decode(&frame).unwrap();
        assert!((decoded.message.linear_velocity - 0.25).abs() < 1e-9);

        // 命令 ID 不属于反馈解码器
        let frame = frame_with(ID_CTRL_CMD, |_| {}, 1);
        assert_eq!(
            decoder.decode(&frame),
            Err(ProtocolError::InvalidCanId {
                id: ID_CTRL_CMD,
                expected: ID_CTRL_FB
            })
        );
    }

    #[test]
    fn test_bms_feedback_signals() {
        let frame = frame_with(
            ID_BMS_FB,
            |d| {
                set_bits(d, 0, 16, 4850);
                set_bits(d, 16, 16, -320);
                set_bits(d, 32, 16, 6012);
            },
            0,
        );
        let msg = BmsFeedbackDecoder::new().decode(&frame).unwrap().message;
        assert!((msg.voltage - 48.5).abs() < 1e-9);
        assert!((msg.current + 3.2).abs() < 1e-9);
        assert!((msg.remaining_capacity - 60.12).abs() < 1e-9);
    }

    #[test]
    fn test_bms_flag_feedback_signals() {
        let frame = frame_with(
            ID_BMS_FLAG_FB,
            |d| {
                set_bits(d, 0, 8, 87);
                set_bits(d, 21, 1, 1);
                set_bits(d, 28, 12, 352);
                set_bits(d, 40, 12, -55);
            },
            0,
        );
        let msg = BmsFlagFeedbackDecoder::new().decode(&frame).unwrap().message;
        assert_eq!(msg.soc, 87);
        assert!(msg.is_charging);
        assert!((msg.max_temperature - 35.2).abs() < 1e-9);
        assert!((msg.min_temperature + 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_bad_bcc_still_decodes() {
        let mut frame = frame_with(ID_BMS_FB, |d| set_bits(d, 0, 16, 1000), 0);
        frame.data[7] ^= 0xFF;
        let decoded = BmsFeedbackDecoder::new().decode(&frame).unwrap();
        assert!(!decoded.bcc_valid);
        assert!(!decoded.is_valid());
        assert!((decoded.message.voltage - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_counter_gap_detected() {
        let mut decoder = BmsFeedbackDecoder::new();
        assert!(decoder.decode(&frame_with(ID_BMS_FB, |_| {}, 15)).unwrap().counter_ok);
        assert!(decoder.decode(&frame_with(ID_BMS_FB, |_| {}, 0)).unwrap().counter_ok);
        assert!(!decoder.decode(&frame_with(ID_BMS_FB, |_| {}, 2)).unwrap().counter_ok);
        assert_eq!(decoder.frame_count(), 3);
        assert_eq!(decoder.last_counter(), Some(2));
    }

    #[test]
    fn test_short_frame_rejected_without_touching_tracker() {
        let mut decoder = BmsFlagFeedbackDecoder::new();
        let frame = RoverFrame::new_extended(ID_BMS_FLAG_FB, &[1, 2, 3]);
        assert_eq!(
            decoder.decode(&frame),
            Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: 3
            })
        );
        assert_eq!(decoder.last_counter(), None);
        assert_eq!(decoder.frame_count(), 0);
    }

    #[test]
    fn test_decoders_keep_independent_sequences() {
        let mut encoder: FrameEncoder<CtrlFeedback> = FrameEncoder::new();
        let mut a = CtrlFeedbackDecoder::new();
        let mut b = CtrlFeedbackDecoder::new();

        let f0 = encoder.encode(&CtrlFeedback::default());
        let f1 = encoder.encode(&CtrlFeedback::default());
        assert!(a.decode(&f0).unwrap().counter_ok);
        assert!(a.decode(&f1).unwrap().counter_ok);
        // b 没见过 f0，首帧恒为连续
        assert!(b.decode(&f1).unwrap().counter_ok);
    }

    #[test]
    fn test_timestamp_is_carried() {
        let frame = frame_with(ID_BMS_FB, |_| {}, 0).with_timestamp(123_456);
        let decoded = BmsFeedbackDecoder::new().decode(&frame).unwrap();
        assert_eq!(decoded.timestamp_us, 123_456);
    }
}
