//! 入站控制命令

use rover_protocol::{CtrlCmd, Gear};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

fn default_robot_id() -> String {
    "00".to_string()
}

fn lenient_gear<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(i64),
        Float(f64),
        Text(String),
    }

    let raw = match Repr::deserialize(deserializer)? {
        Repr::Int(n) => n,
        Repr::Float(x) if x.is_finite() => x.trunc() as i64,
        Repr::Float(x) => return Err(D::Error::custom(format!("invalid gear {}", x))),
        Repr::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("invalid gear '{}'", text)))?,
    };
    u8::try_from(raw).map_err(|_| D::Error::custom(format!("gear {} out of range 0..=255", raw)))
}

/// `ROBOT/{id}/Control` 的 JSON 载荷
///
/// 缺失的数值字段为 0，缺失的机器人 ID 为 `"00"`；也接受旧键名 `Robot_Id`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    #[serde(default = "default_robot_id", alias = "Robot_Id")]
    pub robot_id: String,
    /// 原始档位值；接受整数、小数（截断取整）或数字字符串
    #[serde(rename = "Gear", default, deserialize_with = "lenient_gear")]
    pub gear: u8,
    /// m/s
    #[serde(rename = "Speed", default)]
    pub speed: f64,
    /// °/s，编码为控制帧的角速度
    #[serde(rename = "Steer", default)]
    pub steer: f64,
    /// °
    #[serde(rename = "SideSlip", default)]
    pub side_slip: f64,
}

impl ControlCommand {
    pub fn new(robot_id: impl Into<String>, gear: u8, speed: f64, steer: f64, side_slip: f64) -> Self {
        Self {
            robot_id: robot_id.into(),
            gear,
            speed,
            steer,
            side_slip,
        }
    }

    /// 档位 0、全部数值为 0
    pub fn neutral(robot_id: impl Into<String>) -> Self {
        Self::new(robot_id, 0, 0.0, 0.0, 0.0)
    }

    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "robot_id": self.robot_id,
            "Gear": self.gear,
            "Speed": self.speed,
            "Steer": self.steer,
            "SideSlip": self.side_slip,
        })
    }

    pub fn gear(&self) -> Gear {
        Gear::from(self.gear)
    }

    /// 转为 CAN 控制帧内容
    pub fn to_ctrl_cmd(&self) -> CtrlCmd {
        CtrlCmd::new(self.gear(), self.speed, self.steer, self.side_slip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_command() {
        let cmd = ControlCommand::from_json(&json!({
            "robot_id": "01", "Gear": 6, "Speed": 0.5, "Steer": 10.0, "SideSlip": -2.0
        }))
        .unwrap();
        assert_eq!(cmd, ControlCommand::new("01", 6, 0.5, 10.0, -2.0));
        assert_eq!(cmd.gear(), Gear::FourSteerFourDrive);
    }

    #[test]
    fn test_missing_fields_default() {
        let cmd = ControlCommand::from_json(&json!({"Speed": 1})).unwrap();
        assert_eq!(cmd.robot_id, "00");
        assert_eq!(cmd.gear, 0);
        assert_eq!(cmd.speed, 1.0);
        assert_eq!(cmd.steer, 0.0);
    }

    #[test]
    fn test_legacy_robot_id_key() {
        let cmd = ControlCommand::from_json(&json!({"Robot_Id": "07", "Gear": 7})).unwrap();
        assert_eq!(cmd.robot_id, "07");
        assert_eq!(cmd.gear(), Gear::Crab);
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(ControlCommand::from_json(&json!({"Gear": "six"})).is_err());
        assert!(ControlCommand::from_json(&json!([1, 2, 3])).is_err());
        assert!(ControlCommand::from_json(&json!({"Gear": 300})).is_err());
        assert!(ControlCommand::from_json(&json!({"Gear": -1})).is_err());
        assert!(ControlCommand::from_json(&json!({"Gear": 256.0})).is_err());
        assert!(ControlCommand::from_json(&json!({"Gear": null})).is_err());
    }

    #[test]
    fn test_gear_accepts_float_and_numeric_text() {
        let cmd = ControlCommand::from_json(&json!({"robot_id": "01", "Gear": 6.0})).unwrap();
        assert_eq!(cmd.gear(), Gear::FourSteerFourDrive);
        let cmd = ControlCommand::from_json(&json!({"robot_id": "01", "Gear": 7.9})).unwrap();
        assert_eq!(cmd.gear, 7);
        let cmd = ControlCommand::from_json(&json!({"robot_id": "01", "Gear": " 4 "})).unwrap();
        assert_eq!(cmd.gear(), Gear::FrontRear);
    }

    #[test]
    fn test_unknown_gear_passes_through() {
        let cmd = ControlCommand::new("01", 9, 0.0, 0.0, 0.0);
        assert_eq!(cmd.to_ctrl_cmd().gear, Gear::Unknown(9));
    }

    #[test]
    fn test_json_roundtrip_keys() {
        let value = ControlCommand::new("01", 1, 1.0, 0.0, 0.0).to_json();
        assert_eq!(value["Gear"], 1);
        assert_eq!(value["robot_id"], "01");
        assert_eq!(ControlCommand::from_json(&value).unwrap().speed, 1.0);
    }
}
