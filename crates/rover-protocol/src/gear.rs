//! 档位定义

use num_enum::{FromPrimitive, IntoPrimitive};

/// 底盘档位（4-bit 字段）
///
/// 未定义的原始值原样保留在 `Unknown` 中，解码从不因档位值失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Gear {
    /// 禁用
    Disable = 0,
    /// 驻车
    Park = 1,
    /// 空挡
    Neutral = 2,
    /// 前后轮转向（未启用）
    FrontRear = 4,
    /// 四轮转向四轮驱动
    FourSteerFourDrive = 6,
    /// 横移
    Crab = 7,
    #[num_enum(catch_all)]
    Unknown(u8),
}

// num_enum 把 `#[default]` 当作 FromPrimitive 的回退值，与 catch_all 互斥
impl Default for Gear {
    fn default() -> Self {
        Gear::Disable
    }
}

impl Gear {
    pub fn raw(self) -> u8 {
        self.into()
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Gear::Unknown(_))
    }

    /// 十进制标签：已知档位为 `"6"`，未知值为 `"unknown(9)"`
    pub fn label(self) -> String {
        match self {
            Gear::Unknown(raw) => format!("unknown({raw})"),
            known => known.raw().to_string(),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Gear::Disable => "disable",
            Gear::Park => "park",
            Gear::Neutral => "neutral",
            Gear::FrontRear => "front-rear steering",
            Gear::FourSteerFourDrive => "4T4D",
            Gear::Crab => "crab",
            Gear::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for Gear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}
