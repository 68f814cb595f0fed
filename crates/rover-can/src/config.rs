//! 后端选择与总线打开

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    AdapterFactory, BoxedRxAdapter, BoxedTxAdapter, CanDeviceError, CanDeviceErrorKind, CanError,
};

/// CAN 后端类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanBackend {
    /// 物理 SocketCAN 接口，连接前可执行 `ip link` bring-up
    #[default]
    #[serde(rename = "socketcan")]
    SocketCan,
    /// 虚拟 CAN（vcan），接口需预先创建并 UP，无波特率
    #[serde(rename = "vcan")]
    Vcan,
    /// GS-USB / candleLight USB 适配器（需 `gs_usb` feature），波特率由设备直接设置
    #[serde(rename = "gs_usb", alias = "candle")]
    GsUsb,
}

impl CanBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            CanBackend::SocketCan => "socketcan",
            CanBackend::Vcan => "vcan",
            CanBackend::GsUsb => "gs_usb",
        }
    }

    /// 是否需要在打开前配置系统接口
    pub fn requires_bring_up(self) -> bool {
        matches!(self, CanBackend::SocketCan)
    }
}

/// CAN 总线配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    pub backend: CanBackend,
    /// 接口名（如 "can0"）
    pub channel: String,
    /// 波特率（bps）
    pub bitrate: u32,
    /// 打开前执行 `ip link set <ch> down` / `up type can bitrate <b>`
    pub bring_up: bool,
    /// bring-up 命令是否经 `sudo` 执行
    pub use_sudo: bool,
    /// 仅 gs_usb：按 USB 序列号选择设备，缺省取第一个
    pub serial_number: Option<String>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            backend: CanBackend::SocketCan,
            channel: "can0".to_string(),
            bitrate: 500_000,
            bring_up: true,
            use_sudo: true,
            serial_number: None,
        }
    }
}

impl CanConfig {
    pub fn new(backend: CanBackend, channel: impl Into<String>, bitrate: u32) -> Self {
        Self {
            backend,
            channel: channel.into(),
            bitrate,
            ..Self::default()
        }
    }
}

impl CanConfig {
    #[cfg(target_os = "linux")]
    fn open_socketcan(&self) -> Result<(BoxedRxAdapter, BoxedTxAdapter), CanError> {
        use crate::socketcan::{SocketCanAdapter, interface};

        // bring-up 失败不中止：接口可能已由系统预先配置，打开时会再检查状态
        if self.backend.requires_bring_up()
            && self.bring_up
            && let Err(e) = interface::bring_up(&self.channel, self.bitrate, self.use_sudo)
        {
            warn!("CAN interface bring-up failed, opening anyway: {}", e);
        }

        let adapter = SocketCanAdapter::new(&self.channel)?;
        info!(
            "Opened {} interface '{}' ({} bps)",
            self.backend.as_str(),
            self.channel,
            self.bitrate
        );
        crate::split_boxed(adapter)
    }

    #[cfg(not(target_os = "linux"))]
    fn open_socketcan(&self) -> Result<(BoxedRxAdapter, BoxedTxAdapter), CanError> {
        info!("Backend {} requested on a non-Linux host", self.backend.as_str());
        Err(unavailable(format!(
            "{} backend is only available on Linux",
            self.backend.as_str()
        )))
    }

    #[cfg(feature = "gs_usb")]
    fn open_gs_usb(&self) -> Result<(BoxedRxAdapter, BoxedTxAdapter), CanError> {
        let adapter = crate::gs_usb::GsUsbAdapter::open(self.serial_number.as_deref(), self.bitrate)?;
        info!(
            "Opened gs_usb device {} ({} bps)",
            adapter.serial().unwrap_or("without serial number"),
            self.bitrate
        );
        crate::split_boxed(adapter)
    }

    #[cfg(not(feature = "gs_usb"))]
    fn open_gs_usb(&self) -> Result<(BoxedRxAdapter, BoxedTxAdapter), CanError> {
        Err(unavailable(
            "gs_usb backend requires building with the `gs_usb` feature".to_string(),
        ))
    }
}

#[cfg_attr(all(target_os = "linux", feature = "gs_usb"), allow(dead_code))]
fn unavailable(message: String) -> CanError {
    CanError::Device(CanDeviceError::new(CanDeviceErrorKind::Backend, message))
}

impl AdapterFactory for CanConfig {
    fn open(&self) -> Result<(BoxedRxAdapter, BoxedTxAdapter), CanError> {
        match self.backend {
            CanBackend::SocketCan | CanBackend::Vcan => self.open_socketcan(),
            CanBackend::GsUsb => self.open_gs_usb(),
        }
    }

    fn describe(&self) -> String {
        match self.backend {
            CanBackend::GsUsb => format!(
                "CAN bus gs_usb on device {} with bitrate {} bps",
                self.serial_number.as_deref().unwrap_or("auto"),
                self.bitrate
            ),
            _ => format!(
                "CAN bus {} on channel {} with bitrate {} bps",
                self.backend.as_str(),
                self.channel,
                self.bitrate
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CanConfig::default();
        assert_eq!(config.backend, CanBackend::SocketCan);
        assert_eq!(config.channel, "can0");
        assert_eq!(config.bitrate, 500_000);
        assert!(config.bring_up);
    }

    #[test]
    fn test_backend_requires_bring_up() {
        assert!(CanBackend::SocketCan.requires_bring_up());
        assert!(!CanBackend::Vcan.requires_bring_up());
        assert!(!CanBackend::GsUsb.requires_bring_up());
    }

    #[test]
    fn test_describe() {
        let config = CanConfig::new(CanBackend::Vcan, "vcan0", 250_000);
        assert_eq!(
            config.describe(),
            "CAN bus vcan on channel vcan0 with bitrate 250000 bps"
        );
    }

    #[test]
    fn test_describe_gs_usb() {
        let mut config = CanConfig::new(CanBackend::GsUsb, "", 1_000_000);
        assert_eq!(
            config.describe(),
            "CAN bus gs_usb on device auto with bitrate 1000000 bps"
        );
        config.serial_number = Some("004A0033".into());
        assert!(config.describe().contains("device 004A0033"));
    }

    #[cfg(not(feature = "gs_usb"))]
    #[test]
    fn test_gs_usb_without_feature_reports_backend_error() {
        let config = CanConfig::new(CanBackend::GsUsb, "", 500_000);
        let err = config.open().err().unwrap();
        assert!(err.to_string().contains("`gs_usb` feature"));
        assert!(!err.is_fatal());
    }
}
