//! CAN ID 常量定义
//!
//! 底盘所有报文均为 29-bit 扩展帧。低字节 `D0` 为上位机发出，`EF` 为底盘反馈。

/// 控制指令 ctrl_cmd（档位、线速度、角速度、侧偏角）
pub const ID_CTRL_CMD: u32 = 0x18C4_D1D0;

/// 转向控制指令 steering_ctrl_cmd（档位、线速度、转向角、侧偏角）
pub const ID_STEERING_CTRL_CMD: u32 = 0x18C4_D2D0;

/// 控制反馈 ctrl_fb
pub const ID_CTRL_FB: u32 = 0x18C4_D1EF;

/// 转向控制反馈 steering_ctrl_fb
pub const ID_STEERING_CTRL_FB: u32 = 0x18C4_D2EF;

/// BMS 反馈 bms_fb（电压、电流、剩余容量）
pub const ID_BMS_FB: u32 = 0x18C4_E1EF;

/// BMS 状态标志反馈 bms_flag_fb（SOC、充电标志、温度）
pub const ID_BMS_FLAG_FB: u32 = 0x18C4_E2EF;

/// 底盘反馈报文类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackKind {
    CtrlFb,
    SteeringCtrlFb,
    BmsFb,
    BmsFlagFb,
}

impl FeedbackKind {
    /// 按仲裁 ID 识别反馈报文，未知 ID 返回 `None`
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            ID_CTRL_FB => Some(Self::CtrlFb),
            ID_STEERING_CTRL_FB => Some(Self::SteeringCtrlFb),
            ID_BMS_FB => Some(Self::BmsFb),
            ID_BMS_FLAG_FB => Some(Self::BmsFlagFb),
            _ => None,
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Self::CtrlFb => ID_CTRL_FB,
            Self::SteeringCtrlFb => ID_STEERING_CTRL_FB,
            Self::BmsFb => ID_BMS_FB,
            Self::BmsFlagFb => ID_BMS_FLAG_FB,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CtrlFb => "ctrl_fb",
            Self::SteeringCtrlFb => "steering_ctrl_fb",
            Self::BmsFb => "bms_fb",
            Self::BmsFlagFb => "bms_flag_fb",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_kind_roundtrip() {
        for kind in [
            FeedbackKind::CtrlFb,
            FeedbackKind::SteeringCtrlFb,
            FeedbackKind::BmsFb,
            FeedbackKind::BmsFlagFb,
        ] {
            assert_eq!(FeedbackKind::from_id(kind.id()), Some(kind));
        }
    }

    #[test]
    fn test_command_ids_are_not_feedback() {
        assert_eq!(FeedbackKind::from_id(ID_CTRL_CMD), None);
        assert_eq!(FeedbackKind::from_id(ID_STEERING_CTRL_CMD), None);
    }

    #[test]
    fn test_ids_fit_extended_range() {
        for id in [
            ID_CTRL_CMD,
            ID_STEERING_CTRL_CMD,
            ID_CTRL_FB,
            ID_STEERING_CTRL_FB,
            ID_BMS_FB,
            ID_BMS_FLAG_FB,
        ] {
            assert!(id <= 0x1FFF_FFFF);
        }
    }
}
