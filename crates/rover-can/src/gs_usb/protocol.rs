//! GS-USB 线上格式（经典 CAN，无硬件时间戳）

/// 设置位定时
pub const BREQ_BITTIMING: u8 = 1;
/// 启动 / 复位
pub const BREQ_MODE: u8 = 2;
/// 查询位定时约束
pub const BREQ_BT_CONST: u8 = 4;

/// Host → Device | Vendor | Interface
pub const REQ_OUT: u8 = 0x41;
/// Device → Host | Vendor | Interface
pub const REQ_IN: u8 = 0xC1;

pub const MODE_RESET: u32 = 0;
pub const MODE_START: u32 = 1;
pub const MODE_FLAGS_NORMAL: u32 = 0;

pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;

/// 错误帧 data[1]：控制器状态
pub const CAN_ERR_CRTL_TX_BUS_OFF: u8 = 0x40;
pub const CAN_ERR_CRTL_RX_BUS_OFF: u8 = 0x80;

/// 主机发出的帧使用的 echo id
pub const TX_ECHO_ID: u32 = 0;
/// 总线上收到的帧
pub const RX_ECHO_ID: u32 = 0xFFFF_FFFF;

pub const FLAG_OVERFLOW: u8 = 0x01;

pub const HOST_FRAME_SIZE: usize = 20;
pub const BT_CONST_SIZE: usize = 40;

/// USB 上传输的一帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFrame {
    pub echo_id: u32,
    /// 带 EFF/RTR/ERR 标志位的 ID
    pub can_id: u32,
    pub dlc: u8,
    pub channel: u8,
    pub flags: u8,
    pub data: [u8; 8],
}

impl HostFrame {
    pub fn to_bytes(&self) -> [u8; HOST_FRAME_SIZE] {
        let mut buf = [0u8; HOST_FRAME_SIZE];
        buf[0..4].copy_from_slice(&self.echo_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.can_id.to_le_bytes());
        buf[8] = self.dlc;
        buf[9] = self.channel;
        buf[10] = self.flags;
        buf[12..20].copy_from_slice(&self.data);
        buf
    }

    /// 不足一帧时返回 `None`
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; HOST_FRAME_SIZE] = buf.get(..HOST_FRAME_SIZE)?.try_into().ok()?;
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut data = [0u8; 8];
        data.copy_from_slice(&buf[12..20]);
        Some(Self {
            echo_id: word(0),
            can_id: word(4),
            dlc: buf[8],
            channel: buf[9],
            flags: buf[10],
            data,
        })
    }

    /// 一个 bulk 包可能携带多帧，尾部残片丢弃
    pub fn parse_packet(packet: &[u8]) -> impl Iterator<Item = HostFrame> + '_ {
        packet.chunks_exact(HOST_FRAME_SIZE).filter_map(HostFrame::from_bytes)
    }

    pub fn is_echo(&self) -> bool {
        self.echo_id != RX_ECHO_ID
    }

    pub fn is_error(&self) -> bool {
        self.can_id & CAN_ERR_FLAG != 0
    }

    pub fn is_remote(&self) -> bool {
        self.can_id & CAN_RTR_FLAG != 0
    }

    pub fn is_bus_off(&self) -> bool {
        self.is_error()
            && self.dlc >= 2
            && self.data[1] & (CAN_ERR_CRTL_TX_BUS_OFF | CAN_ERR_CRTL_RX_BUS_OFF) != 0
    }

    pub fn has_overflow(&self) -> bool {
        self.flags & FLAG_OVERFLOW != 0
    }
}

/// `BT_CONST` 应答中的位定时约束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapability {
    pub feature: u32,
    pub fclk_can: u32,
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
}

impl DeviceCapability {
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < BT_CONST_SIZE {
            return None;
        }
        let mut words = buf[..BT_CONST_SIZE]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        let mut next = || words.next().unwrap_or(0);
        Some(Self {
            feature: next(),
            fclk_can: next(),
            tseg1_min: next(),
            tseg1_max: next(),
            tseg2_min: next(),
            tseg2_max: next(),
            sjw_max: next(),
            brp_min: next(),
            brp_max: next(),
            brp_inc: next(),
        })
    }
}

/// `BITTIMING` 请求体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
    pub sjw: u32,
    pub brp: u32,
}

impl BitTiming {
    /// 每位的时间份额数（含同步段）
    pub fn quanta(&self) -> u32 {
        1 + self.prop_seg + self.phase_seg1 + self.phase_seg2
    }

    pub fn bitrate(&self, fclk_can: u32) -> u32 {
        fclk_can / (self.brp * self.quanta())
    }

    /// 采样点（千分比）
    pub fn sample_point(&self) -> u32 {
        (self.quanta() - self.phase_seg2) * 1000 / self.quanta()
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        for (slot, value) in buf.chunks_exact_mut(4).zip([
            self.prop_seg,
            self.phase_seg1,
            self.phase_seg2,
            self.sjw,
            self.brp,
        ]) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        buf
    }
}

/// `MODE` 请求体
pub fn mode_request(mode: u32, flags: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&mode.to_le_bytes());
    buf[4..8].copy_from_slice(&flags.to_le_bytes());
    buf
}

/// CiA 301 推荐采样点（千分比）
fn target_sample_point(bitrate: u32) -> u32 {
    match bitrate {
        b if b > 800_000 => 750,
        b if b > 500_000 => 800,
        _ => 875,
    }
}

/// 在设备约束内求一组精确匹配 `bitrate` 的位定时
///
/// 只接受整除的分频；多组可行时取采样点误差最小者，误差相同取份额数较多者。
pub fn compute_bit_timing(cap: &DeviceCapability, bitrate: u32) -> Option<BitTiming> {
    if bitrate == 0 || cap.fclk_can == 0 {
        return None;
    }
    let target = target_sample_point(bitrate);
    let mut best: Option<(u32, BitTiming)> = None;

    for quanta in (8..=25u32).rev() {
        let per_bit = u64::from(bitrate) * u64::from(quanta);
        if u64::from(cap.fclk_can) % per_bit != 0 {
            continue;
        }
        let Ok(brp) = u32::try_from(u64::from(cap.fclk_can) / per_bit) else {
            continue;
        };
        if brp < cap.brp_min.max(1)
            || brp > cap.brp_max
            || (cap.brp_inc > 1 && brp % cap.brp_inc != 0)
        {
            continue;
        }

        let sample = (quanta * target + 500) / 1000;
        let tseg2 = (quanta - sample).clamp(cap.tseg2_min.max(1), cap.tseg2_max.max(1));
        let Some(tseg1) = quanta.checked_sub(1 + tseg2) else {
            continue;
        };
        if tseg1 < cap.tseg1_min.max(2) || tseg1 > cap.tseg1_max {
            continue;
        }

        let prop_seg = tseg1 / 2;
        let timing = BitTiming {
            prop_seg,
            phase_seg1: tseg1 - prop_seg,
            phase_seg2: tseg2,
            sjw: tseg2.min(cap.sjw_max.max(1)),
            brp,
        };
        let error = timing.sample_point().abs_diff(target);
        if best.as_ref().is_none_or(|(best_error, _)| error < *best_error) {
            best = Some((error, timing));
        }
    }
    best.map(|(_, timing)| timing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candlelight(fclk_can: u32) -> DeviceCapability {
        DeviceCapability {
            feature: 0,
            fclk_can,
            tseg1_min: 1,
            tseg1_max: 16,
            tseg2_min: 1,
            tseg2_max: 8,
            sjw_max: 4,
            brp_min: 1,
            brp_max: 1024,
            brp_inc: 1,
        }
    }

    #[test]
    fn test_host_frame_layout() {
        let frame = HostFrame {
            echo_id: TX_ECHO_ID,
            can_id: 0x18C4_D1D0 | CAN_EFF_FLAG,
            dlc: 8,
            channel: 0,
            flags: 0,
            data: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0xD0, 0xD1, 0xC4, 0x98]);
        assert_eq!(bytes[8], 8);
        assert_eq!(&bytes[12..20], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(HostFrame::from_bytes(&bytes), Some(frame));
    }

    #[test]
    fn test_packet_with_several_frames() {
        let rx = HostFrame {
            echo_id: RX_ECHO_ID,
            can_id: 0x18C4_E1EF | CAN_EFF_FLAG,
            dlc: 8,
            channel: 0,
            flags: 0,
            data: [0xAA; 8],
        };
        let echo = HostFrame { echo_id: TX_ECHO_ID, ..rx };
        let mut packet = Vec::new();
        packet.extend_from_slice(&rx.to_bytes());
        packet.extend_from_slice(&echo.to_bytes());
        packet.extend_from_slice(&[0xFF; 7]);

        let frames: Vec<HostFrame> = HostFrame::parse_packet(&packet).collect();
        assert_eq!(frames.len(), 2);
        assert!(!frames[0].is_echo());
        assert!(frames[1].is_echo());
        assert_eq!(HostFrame::from_bytes(&[0u8; 19]), None);
    }

    #[test]
    fn test_bus_off_error_frame() {
        let mut frame = HostFrame {
            echo_id: RX_ECHO_ID,
            can_id: CAN_ERR_FLAG | 0x40,
            dlc: 8,
            channel: 0,
            flags: 0,
            data: [0; 8],
        };
        assert!(frame.is_error());
        assert!(!frame.is_bus_off());
        frame.data[1] = CAN_ERR_CRTL_TX_BUS_OFF;
        assert!(frame.is_bus_off());
    }

    #[test]
    fn test_capability_parse() {
        let mut buf = Vec::new();
        for word in [0u32, 48_000_000, 1, 16, 1, 8, 4, 1, 1024, 1] {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        assert_eq!(DeviceCapability::from_bytes(&buf), Some(candlelight(48_000_000)));
        assert_eq!(DeviceCapability::from_bytes(&buf[..39]), None);
    }

    #[test]
    fn test_bit_timing_48mhz_500k() {
        let timing = compute_bit_timing(&candlelight(48_000_000), 500_000).unwrap();
        assert_eq!(timing.brp, 6);
        assert_eq!(timing.quanta(), 16);
        assert_eq!(timing.sample_point(), 875);
        assert_eq!(timing.bitrate(48_000_000), 500_000);
    }

    #[test]
    fn test_bit_timing_exact_for_common_rates() {
        for fclk in [40_000_000, 48_000_000, 80_000_000] {
            for bitrate in [125_000, 250_000, 500_000, 1_000_000] {
                let cap = candlelight(fclk);
                let timing = compute_bit_timing(&cap, bitrate)
                    .unwrap_or_else(|| panic!("{} bps @ {} Hz", bitrate, fclk));
                assert_eq!(timing.bitrate(fclk), bitrate);
                assert!(timing.phase_seg2 <= cap.tseg2_max);
                assert!(timing.prop_seg + timing.phase_seg1 <= cap.tseg1_max);
                assert!(timing.sjw <= cap.sjw_max);
                assert!(timing.sample_point().abs_diff(target_sample_point(bitrate)) <= 50);
            }
        }
    }

    #[test]
    fn test_bit_timing_unreachable_rate() {
        assert_eq!(compute_bit_timing(&candlelight(48_000_000), 333_333), None);
        assert_eq!(compute_bit_timing(&candlelight(48_000_000), 0), None);
    }

    #[test]
    fn test_bit_timing_request_layout() {
        let timing = BitTiming {
            prop_seg: 6,
            phase_seg1: 7,
            phase_seg2: 2,
            sjw: 1,
            brp: 6,
        };
        let bytes = timing.to_bytes();
        assert_eq!(&bytes[0..4], &6u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &6u32.to_le_bytes());
        assert_eq!(mode_request(MODE_START, 0)[0..4], 1u32.to_le_bytes());
    }
}
