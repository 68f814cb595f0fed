//! GS-USB（candleLight）USB-CAN 后端
//!
//! 启用 `gs_usb` feature 后可用，不依赖系统 CAN 接口。
//!
//! - 设备打开后即按配置的波特率计算位定时并启动，无需 `ip link`
//! - 一个 USB bulk 包可能携带多帧；多余的帧缓存在 RX 半边
//! - 设备把本机发出的帧作为回显送回，RX 半边会丢弃这些回显
//! - 每次 `receive()` 最多读一个 bulk 包，读不到数据帧时返回 `Timeout`，
//!   使接收线程能按时检查停止标志

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, trace, warn};

use crate::{
    CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError, RoverFrame, RxAdapter,
    SplittableAdapter, TxAdapter, now_us,
};

pub mod device;
pub mod protocol;

pub use device::{GsUsbDevice, GsUsbError};
use protocol::{CAN_EFF_FLAG, CAN_EFF_MASK, CAN_SFF_MASK, HostFrame, TX_ECHO_ID};

const DEFAULT_RX_TIMEOUT: Duration = Duration::from_millis(10);
const DEFAULT_TX_TIMEOUT: Duration = Duration::from_millis(100);

/// rusb 把 0 视为无限等待
fn usb_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

impl From<GsUsbError> for CanError {
    fn from(e: GsUsbError) -> Self {
        let kind = match &e {
            GsUsbError::ReadTimeout => return CanError::Timeout,
            GsUsbError::NotFound { .. } | GsUsbError::Usb(rusb::Error::NotFound) => {
                CanDeviceErrorKind::NotFound
            },
            GsUsbError::Usb(rusb::Error::NoDevice) => CanDeviceErrorKind::NoDevice,
            GsUsbError::Usb(rusb::Error::Access) => CanDeviceErrorKind::AccessDenied,
            GsUsbError::ShortReply { .. } => CanDeviceErrorKind::InvalidFrame,
            _ => CanDeviceErrorKind::Backend,
        };
        CanError::Device(CanDeviceError::new(kind, e.to_string()))
    }
}

pub(crate) fn to_host_frame(frame: &RoverFrame) -> HostFrame {
    let can_id = if frame.is_extended {
        (frame.id & CAN_EFF_MASK) | CAN_EFF_FLAG
    } else {
        frame.id & CAN_SFF_MASK
    };
    HostFrame {
        echo_id: TX_ECHO_ID,
        can_id,
        dlc: frame.len.min(8),
        channel: 0,
        flags: 0,
        data: frame.data,
    }
}

/// 过滤回显、远程帧与错误帧；总线关闭时报错
pub(crate) fn to_rover_frame(frame: &HostFrame, timestamp_us: u64) -> Result<Option<RoverFrame>, CanError> {
    if frame.is_echo() {
        trace!("Dropping TX echo 0x{:X}", frame.can_id & CAN_EFF_MASK);
        return Ok(None);
    }
    if frame.has_overflow() {
        warn!("GS-USB receive buffer overflowed, frames were lost");
    }
    if frame.is_bus_off() {
        error!("CAN bus off reported by GS-USB device (data {:02X?})", frame.data);
        return Err(CanError::BusOff);
    }
    if frame.is_error() || frame.is_remote() {
        trace!("Ignoring non-data frame, raw id 0x{:08X}", frame.can_id);
        return Ok(None);
    }

    let is_extended = frame.can_id & CAN_EFF_FLAG != 0;
    let id = if is_extended {
        frame.can_id & CAN_EFF_MASK
    } else {
        frame.can_id & CAN_SFF_MASK
    };
    let len = usize::from(frame.dlc.min(8));
    Ok(Some(
        RoverFrame::new(id, &frame.data[..len], is_extended).with_timestamp(timestamp_us),
    ))
}

/// 从缓存或一个新 bulk 包中取下一帧数据帧
fn receive_from(
    device: &GsUsbDevice,
    pending: &mut VecDeque<RoverFrame>,
    timeout: Duration,
) -> Result<RoverFrame, CanError> {
    if let Some(frame) = pending.pop_front() {
        return Ok(frame);
    }

    let packet = device.read_packet(usb_timeout(timeout))?;
    let timestamp_us = now_us();
    for host_frame in &packet {
        if let Some(frame) = to_rover_frame(host_frame, timestamp_us)? {
            pending.push_back(frame);
        }
    }
    pending.pop_front().ok_or(CanError::Timeout)
}

/// 未分离的 GS-USB 适配器
pub struct GsUsbAdapter {
    device: Arc<GsUsbDevice>,
    rx_timeout: Duration,
    tx_timeout: Duration,
    pending: VecDeque<RoverFrame>,
}

impl GsUsbAdapter {
    /// 打开设备（可按序列号选择）并以 `bitrate` 启动
    pub fn open(serial: Option<&str>, bitrate: u32) -> Result<Self, CanError> {
        let mut device = GsUsbDevice::open(serial)?;
        device.start(bitrate)?;
        Ok(Self {
            device: Arc::new(device),
            rx_timeout: DEFAULT_RX_TIMEOUT,
            tx_timeout: DEFAULT_TX_TIMEOUT,
            pending: VecDeque::with_capacity(16),
        })
    }

    pub fn serial(&self) -> Option<&str> {
        self.device.serial()
    }
}

impl CanAdapter for GsUsbAdapter {
    fn send(&mut self, frame: RoverFrame) -> Result<(), CanError> {
        self.send_timeout(frame, self.tx_timeout)
    }

    fn send_timeout(&mut self, frame: RoverFrame, timeout: Duration) -> Result<(), CanError> {
        self.device
            .write_frame(&to_host_frame(&frame), usb_timeout(timeout))
            .map_err(CanError::from)
    }

    fn receive(&mut self) -> Result<RoverFrame, CanError> {
        receive_from(&self.device, &mut self.pending, self.rx_timeout)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.rx_timeout = timeout;
    }
}

impl SplittableAdapter for GsUsbAdapter {
    type RxAdapter = GsUsbRxAdapter;
    type TxAdapter = GsUsbTxAdapter;

    fn split(self) -> Result<(GsUsbRxAdapter, GsUsbTxAdapter), CanError> {
        let rx = GsUsbRxAdapter {
            device: self.device.clone(),
            timeout: self.rx_timeout,
            pending: self.pending,
        };
        let tx = GsUsbTxAdapter {
            device: self.device,
            timeout: self.tx_timeout,
        };
        Ok((rx, tx))
    }
}

/// 只读半边（接收线程持有）
pub struct GsUsbRxAdapter {
    device: Arc<GsUsbDevice>,
    timeout: Duration,
    pending: VecDeque<RoverFrame>,
}

impl RxAdapter for GsUsbRxAdapter {
    fn receive(&mut self) -> Result<RoverFrame, CanError> {
        receive_from(&self.device, &mut self.pending, self.timeout)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.timeout = timeout;
        Ok(())
    }
}

/// 只写半边（发送路径共享）
pub struct GsUsbTxAdapter {
    device: Arc<GsUsbDevice>,
    timeout: Duration,
}

impl TxAdapter for GsUsbTxAdapter {
    fn send(&mut self, frame: RoverFrame) -> Result<(), CanError> {
        self.send_timeout(frame, self.timeout)
    }

    fn send_timeout(&mut self, frame: RoverFrame, timeout: Duration) -> Result<(), CanError> {
        self.device
            .write_frame(&to_host_frame(&frame), usb_timeout(timeout))
            .map_err(CanError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::{CAN_ERR_CRTL_RX_BUS_OFF, CAN_ERR_FLAG, CAN_RTR_FLAG, RX_ECHO_ID};
    use super::*;

    fn received(can_id: u32, data: [u8; 8]) -> HostFrame {
        HostFrame {
            echo_id: RX_ECHO_ID,
            can_id,
            dlc: 8,
            channel: 0,
            flags: 0,
            data,
        }
    }

    #[test]
    fn test_extended_frame_conversion() {
        let frame = RoverFrame::new_extended(0x18C4_D1D0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let host = to_host_frame(&frame);
        assert_eq!(host.can_id, 0x18C4_D1D0 | CAN_EFF_FLAG);
        assert_eq!(host.dlc, 8);
        assert!(host.is_echo());

        let back = to_rover_frame(&HostFrame { echo_id: RX_ECHO_ID, ..host }, 7)
            .unwrap()
            .unwrap();
        assert_eq!(back.id, 0x18C4_D1D0);
        assert!(back.is_extended);
        assert_eq!(back.data, frame.data);
        assert_eq!(back.timestamp_us, 7);
    }

    #[test]
    fn test_standard_frame_conversion() {
        let frame = RoverFrame::new_standard(0x123, &[0xAA, 0xBB]);
        let host = to_host_frame(&frame);
        assert_eq!(host.can_id, 0x123);
        assert_eq!(host.dlc, 2);

        let back = to_rover_frame(&HostFrame { echo_id: RX_ECHO_ID, ..host }, 0)
            .unwrap()
            .unwrap();
        assert!(!back.is_extended);
        assert_eq!(back.data_slice(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_echo_and_non_data_frames_dropped() {
        let mut echo = received(0x18C4_D1D0 | CAN_EFF_FLAG, [0; 8]);
        echo.echo_id = TX_ECHO_ID;
        assert!(to_rover_frame(&echo, 0).unwrap().is_none());

        let remote = received(0x123 | CAN_RTR_FLAG, [0; 8]);
        assert!(to_rover_frame(&remote, 0).unwrap().is_none());

        let warning = received(CAN_ERR_FLAG | 0x04, [0, 0x04, 0, 0, 0, 0, 0, 0]);
        assert!(to_rover_frame(&warning, 0).unwrap().is_none());
    }

    #[test]
    fn test_bus_off_is_fatal() {
        let bus_off = received(CAN_ERR_FLAG | 0x40, [0, CAN_ERR_CRTL_RX_BUS_OFF, 0, 0, 0, 0, 0, 0]);
        let err = to_rover_frame(&bus_off, 0).unwrap_err();
        assert!(matches!(err, CanError::BusOff));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(CanError::from(GsUsbError::ReadTimeout), CanError::Timeout));
        assert!(CanError::from(GsUsbError::NotFound { serial: None }).is_fatal());
        assert!(CanError::from(GsUsbError::Usb(rusb::Error::NoDevice)).is_fatal());
        assert!(!CanError::from(GsUsbError::WriteTimeout).is_fatal());
    }
}
