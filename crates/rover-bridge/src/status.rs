//! 出站状态快照

use rover_protocol::{BmsFeedback, BmsFlagFeedback, CtrlFeedback, Gear, SteeringCtrlFeedback};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `ROBOT/{id}/Status` 的 JSON 载荷
///
/// 每种反馈帧只更新自己携带的字段，其余字段保持上一次的值。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotStatus {
    pub robot_id: String,
    /// 原始档位值，JSON 中为十进制字符串（如 `"6"`）
    #[serde(rename = "Gear", with = "gear_text")]
    pub gear: u8,
    /// m/s
    #[serde(rename = "Speed")]
    pub speed: f64,
    /// °
    #[serde(rename = "Steering_deg")]
    pub steering_deg: f64,
    /// °
    #[serde(rename = "SideSlip")]
    pub side_slip: f64,
    /// m/s
    pub linear_velocity: f64,
    /// °/s
    pub angular_velocity: f64,
    /// V
    pub battery_voltage: f64,
    /// A
    pub battery_current: f64,
    /// Ah
    pub battery_remaining_capacity: f64,
    /// °C
    pub battery_max_temperature: f64,
    /// °C
    pub battery_min_temperature: f64,
    /// %
    pub battery_soc_percent: f64,
    pub battery_is_charging: bool,
}

impl RobotStatus {
    pub fn new(robot_id: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            ..Self::default()
        }
    }

    pub fn gear(&self) -> Gear {
        Gear::from(self.gear)
    }

    pub fn apply_steering_ctrl(&mut self, fb: &SteeringCtrlFeedback) {
        self.gear = fb.gear.raw();
        self.speed = fb.speed;
        self.steering_deg = fb.steer;
        self.side_slip = fb.side_slip;
    }

    /// 线速度同时写入 `Speed` 与 `linear_velocity`
    pub fn apply_ctrl(&mut self, fb: &CtrlFeedback) {
        self.gear = fb.gear.raw();
        self.speed = fb.linear_velocity;
        self.linear_velocity = fb.linear_velocity;
        self.angular_velocity = fb.angular_velocity;
        self.side_slip = fb.side_slip;
    }

    pub fn apply_bms(&mut self, fb: &BmsFeedback) {
        self.battery_voltage = fb.voltage;
        self.battery_current = fb.current;
        self.battery_remaining_capacity = fb.remaining_capacity;
    }

    pub fn apply_bms_flag(&mut self, fb: &BmsFlagFeedback) {
        self.battery_soc_percent = f64::from(fb.soc);
        self.battery_is_charging = fb.is_charging;
        self.battery_max_temperature = fb.max_temperature;
        self.battery_min_temperature = fb.min_temperature;
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// 档位以字符串发布，与下游按字符串查表的显示端一致；读取时也接受数字
mod gear_text {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(raw: &u8, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(raw)
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u8),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(raw) => Ok(raw),
            Repr::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid gear '{}'", text))),
        }
    }
}
