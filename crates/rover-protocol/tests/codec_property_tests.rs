//! 编解码属性测试
//!
//! 使用 proptest 验证量化误差、计数器递增、BCC 与序列校验。

use proptest::prelude::*;
use rover_protocol::*;

fn known_gear() -> impl Strategy<Value = Gear> {
    prop::sample::select(vec![0u8, 1, 2, 4, 6, 7]).prop_map(Gear::from)
}

proptest! {
    /// 控制指令编码后解码，误差不超过一个量化步长
    #[test]
    fn ctrl_cmd_roundtrip(
        gear in known_gear(),
        speed in -32.768..32.767f64,
        angular in -327.68..327.67f64,
        side_slip in -327.68..327.67f64,
    ) {
        let mut encoder = CtrlCmdEncoder::new();
        let mut decoder = CtrlCmdDecoder::new();
        let frame = encoder.encode(&CtrlCmd::new(gear, speed, angular, side_slip));
        let decoded = decoder.decode(&frame).unwrap();

        prop_assert_eq!(decoded.message.gear, gear);
        prop_assert!((decoded.message.speed - speed).abs() <= 0.001);
        prop_assert!((decoded.message.angular_velocity - angular).abs() <= 0.01);
        prop_assert!((decoded.message.side_slip - side_slip).abs() <= 0.01);
        prop_assert!(decoded.is_valid());
    }

    /// 转向指令与转向反馈共用布局
    #[test]
    fn steering_cmd_decodes_as_feedback_layout(
        gear in known_gear(),
        speed in -32.768..32.767f64,
        steer in -327.68..327.67f64,
        side_slip in -327.68..327.67f64,
    ) {
        let mut encoder = SteeringCtrlCmdEncoder::new();
        let frame = encoder.encode(&SteeringCtrlCmd::new(gear, speed, steer, side_slip));
        let fb = SteeringCtrlFeedback::read_signals(&frame.data);

        prop_assert_eq!(fb.gear, gear);
        prop_assert!((fb.speed - speed).abs() <= 0.001);
        prop_assert!((fb.steer - steer).abs() <= 0.01);
        prop_assert!((fb.side_slip - side_slip).abs() <= 0.01);
    }

    /// 连续编码的计数器依次为 0..15 循环，与信号值无关
    #[test]
    fn counter_progression(speeds in prop::collection::vec(-10.0..10.0f64, 1..64)) {
        let mut encoder = CtrlCmdEncoder::new();
        for (i, speed) in speeds.iter().enumerate() {
            let frame = encoder.encode(&CtrlCmd::new(Gear::Neutral, *speed, 0.0, 0.0));
            prop_assert_eq!(get_bits(&frame.data, 52, 4, false), (i % 16) as i64);
        }
    }

    /// 任意编码输出的 byte 7 等于 byte 0..=6 的异或
    #[test]
    fn checksum_invariant(
        gear in 0u8..16,
        speed in -100.0..100.0f64,
        angular in -1000.0..1000.0f64,
        side_slip in -1000.0..1000.0f64,
        skip in 0usize..16,
    ) {
        let mut encoder = CtrlCmdEncoder::new();
        for _ in 0..skip {
            encoder.encode(&CtrlCmd::default());
        }
        let frame = encoder.encode(&CtrlCmd::new(Gear::from(gear), speed, angular, side_slip));
        let xor = frame.data[..7].iter().fold(0u8, |acc, b| acc ^ b);
        prop_assert_eq!(frame.data[7], xor);
    }

    /// 同一解码器的相邻两帧：counter_ok 当且仅当第二帧计数 = (第一帧 + 1) % 16
    #[test]
    fn sequence_validity(first in 0u8..16, second in 0u8..16) {
        let mut decoder = BmsFeedbackDecoder::new();
        let make = |counter: u8| {
            let mut data = [0u8; 8];
            set_bits(&mut data, 52, 4, i64::from(counter));
            data[7] = bcc(&data);
            RoverFrame::new_extended(ID_BMS_FB, &data)
        };

        prop_assert!(decoder.decode(&make(first)).unwrap().counter_ok);
        let ok = decoder.decode(&make(second)).unwrap().counter_ok;
        prop_assert_eq!(ok, second == (first + 1) % 16);
    }

    /// 任意位置、任意宽度写入后读回
    #[test]
    fn bits_write_read(start in 0u32..56, length in 1u32..=16, value in any::<i64>()) {
        prop_assume!(start + length <= 64);
        let mut data = [0u8; 8];
        set_bits(&mut data, start, length, value);
        let mask = (1i64 << length) - 1;
        prop_assert_eq!(get_bits(&data, start, length, false), value & mask);
    }

    /// 解码器从不因档位值拒绝帧
    #[test]
    fn unknown_gear_passes_through(raw in 0u8..16) {
        let mut data = [0u8; 8];
        set_bits(&mut data, 0, 4, i64::from(raw));
        data[7] = bcc(&data);
        let frame = RoverFrame::new_extended(ID_CTRL_FB, &data);
        let decoded = CtrlFeedbackDecoder::new().decode(&frame).unwrap();
        prop_assert_eq!(decoded.message.gear.raw(), raw);
    }
}

#[test]
fn scenario_ctrl_cmd_decode() {
    let mut encoder = CtrlCmdEncoder::new();
    let mut decoder = CtrlCmdDecoder::new();
    let frame = encoder.encode(&CtrlCmd::new(Gear::from(6u8), 0.5, 10.0, -2.0));
    let decoded = decoder.decode(&frame).unwrap();

    assert_eq!(decoded.message.gear.label(), "6");
    assert!((decoded.message.speed - 0.5).abs() <= 0.001);
    assert!((decoded.message.angular_velocity - 10.0).abs() <= 0.01);
    assert!((decoded.message.side_slip + 2.0).abs() <= 0.01);
}
