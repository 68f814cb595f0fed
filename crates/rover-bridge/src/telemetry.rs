//! 反馈帧解码与状态合并

use rover_protocol::{
    BmsFeedbackDecoder, BmsFlagFeedbackDecoder, CtrlFeedbackDecoder, Decoded, FeedbackKind,
    ProtocolError, RoverFrame, SteeringCtrlFeedbackDecoder,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::status::RobotStatus;

/// 校验失败帧的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramePolicy {
    /// 无论 BCC / 计数器是否通过都合并
    #[default]
    AlwaysApply,
    /// 丢弃 BCC 错误或计数器不连续的帧
    RejectInvalid,
}

/// 单帧处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// 已合并进状态（`valid` 为 BCC 与计数器均通过）
    Applied { kind: FeedbackKind, valid: bool },
    /// 校验失败且策略为 `RejectInvalid`
    Rejected {
        kind: FeedbackKind,
        bcc_valid: bool,
        counter_ok: bool,
    },
    /// 非反馈帧 ID
    Ignored,
    /// 长度或 ID 不符
    Malformed(ProtocolError),
}

impl FrameOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, FrameOutcome::Applied { .. })
    }
}

/// 每种反馈帧一个解码器，计数器状态互不共享
#[derive(Debug, Default)]
pub struct TelemetryDecoders {
    policy: FramePolicy,
    steering_ctrl: SteeringCtrlFeedbackDecoder,
    ctrl: CtrlFeedbackDecoder,
    bms: BmsFeedbackDecoder,
    bms_flag: BmsFlagFeedbackDecoder,
}

impl TelemetryDecoders {
    pub fn new(policy: FramePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> FramePolicy {
        self.policy
    }

    /// 按 ID 解码并把该帧携带的字段合并进 `status`
    pub fn apply(&mut self, frame: &RoverFrame, status: &mut RobotStatus) -> FrameOutcome {
        let Some(kind) = FeedbackKind::from_id(frame.id) else {
            trace!("Ignoring CAN frame 0x{:X}", frame.id);
            return FrameOutcome::Ignored;
        };

        let result = match kind {
            FeedbackKind::SteeringCtrlFb => self
                .steering_ctrl
                .decode(frame)
                .map(|d| self.merge(kind, d, |s, m| s.apply_steering_ctrl(m), status)),
            FeedbackKind::CtrlFb => self
                .ctrl
                .decode(frame)
                .map(|d| self.merge(kind, d, |s, m| s.apply_ctrl(m), status)),
            FeedbackKind::BmsFb => self
                .bms
                .decode(frame)
                .map(|d| self.merge(kind, d, |s, m| s.apply_bms(m), status)),
            FeedbackKind::BmsFlagFb => self
                .bms_flag
                .decode(frame)
                .map(|d| self.merge(kind, d, |s, m| s.apply_bms_flag(m), status)),
        };

        result.unwrap_or_else(|e| {
            warn!("Failed to decode {} frame: {}", kind.name(), e);
            FrameOutcome::Malformed(e)
        })
    }

    fn merge<M>(
        &self,
        kind: FeedbackKind,
        decoded: Decoded<M>,
        apply: impl FnOnce(&mut RobotStatus, &M),
        status: &mut RobotStatus,
    ) -> FrameOutcome {
        let valid = decoded.is_valid();
        if !valid {
            debug!(
                "{} frame failed validation (bcc_valid={}, counter_ok={}, counter={})",
                kind.name(),
                decoded.bcc_valid,
                decoded.counter_ok,
                decoded.counter
            );
            if self.policy == FramePolicy::RejectInvalid {
                return FrameOutcome::Rejected {
                    kind,
                    bcc_valid: decoded.bcc_valid,
                    counter_ok: decoded.counter_ok,
                };
            }
        }
        apply(status, &decoded.message);
        FrameOutcome::Applied { kind, valid }
    }

    /// 已解码帧数，按反馈类型
    pub fn frame_count(&self, kind: FeedbackKind) -> u64 {
        match kind {
            FeedbackKind::SteeringCtrlFb => self.steering_ctrl.frame_count(),
            FeedbackKind::CtrlFb => self.ctrl.frame_count(),
            FeedbackKind::BmsFb => self.bms.frame_count(),
            FeedbackKind::BmsFlagFb => self.bms_flag.frame_count(),
        }
    }

    pub fn reset(&mut self) {
        self.steering_ctrl.reset();
        self.ctrl.reset();
        self.bms.reset();
        self.bms_flag.reset();
    }
}
