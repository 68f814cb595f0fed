//! SocketCAN 适配器实现
//!
//! 基于 Linux SocketCAN 子系统。
//!
//! ## 特性
//!
//! - 支持标准帧和扩展帧
//! - 自动过滤错误帧
//! - 软件接收时间戳（Unix 纪元微秒）
//! - 读写超时基于 `SO_RCVTIMEO` / `SO_SNDTIMEO`
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**
//! - **接口配置**：波特率由 `ip link` 设置，见 [`interface::bring_up`]
//! - **权限要求**：bring-up 需要 `sudo` 或 `CAP_NET_ADMIN`

use crate::{CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError, RoverFrame, now_us};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use std::io;
use std::time::Duration;
use tracing::{trace, warn};

pub mod interface;
pub mod split;

use interface::check_interface_status;
pub use split::{SocketCanRxAdapter, SocketCanTxAdapter};

/// 默认读超时，与接收线程的轮询周期一致
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// SocketCAN 适配器
///
/// # 示例
///
/// ```no_run
/// use rover_can::{CanAdapter, RoverFrame, SocketCanAdapter};
///
/// let mut adapter = SocketCanAdapter::new("vcan0").unwrap();
/// adapter.send(RoverFrame::new_extended(0x18C4D1D0, &[0; 8])).unwrap();
/// let frame = adapter.receive().unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 打开接口
    ///
    /// 打开前检查接口存在且处于 UP 状态，否则返回带修复提示的 `CanError::Device`。
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();

        if !check_interface_status(&interface)? {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NoDevice,
                format!(
                    "CAN interface '{}' exists but is not UP. Please start it first:\n  sudo ip link set up {}",
                    interface, interface
                ),
            )));
        }

        let socket = CanSocket::open(&interface).map_err(|e| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::Backend,
                format!("Failed to open CAN interface '{}': {}", interface, e),
            ))
        })?;

        let read_timeout = DEFAULT_READ_TIMEOUT;
        socket.set_read_timeout(read_timeout).map_err(CanError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);

        Ok(Self {
            socket,
            interface,
            read_timeout,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.socket.set_read_timeout(timeout).map_err(CanError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }
}

/// `RoverFrame` -> `CanFrame`
pub(crate) fn to_can_frame(frame: &RoverFrame) -> Result<CanFrame, CanError> {
    let can_frame = if frame.is_extended {
        ExtendedId::new(frame.id).and_then(|id| CanFrame::new(id, frame.data_slice()))
    } else {
        StandardId::new(frame.id as u16).and_then(|id| CanFrame::new(id, frame.data_slice()))
    };

    can_frame.ok_or_else(|| {
        CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::InvalidFrame,
            format!("Failed to create CAN frame with ID 0x{:X}", frame.id),
        ))
    })
}

/// `CanFrame` -> `RoverFrame`
pub(crate) fn from_can_frame(frame: &CanFrame, timestamp_us: u64) -> RoverFrame {
    RoverFrame::new(frame.raw_id(), frame.data(), frame.is_extended()).with_timestamp(timestamp_us)
}

pub(crate) fn map_io_error(e: io::Error) -> CanError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CanError::Timeout,
        io::ErrorKind::NotFound => CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NoDevice,
            format!("CAN device disappeared: {}", e),
        )),
        io::ErrorKind::PermissionDenied => CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::AccessDenied,
            e.to_string(),
        )),
        _ if e.raw_os_error() == Some(libc::ENODEV) || e.raw_os_error() == Some(libc::ENETDOWN) => {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NoDevice,
                format!("CAN interface went down: {}", e),
            ))
        },
        _ => CanError::Io(e),
    }
}

/// 读取一帧数据帧，错误帧被丢弃
pub(crate) fn read_data_frame(socket: &CanSocket) -> Result<RoverFrame, CanError> {
    loop {
        let frame = socket.read_frame().map_err(map_io_error)?;
        if let CanFrame::Error(err) = &frame {
            warn!("Dropped CAN error frame: {:?}", err);
            continue;
        }
        let rover_frame = from_can_frame(&frame, now_us());
        trace!(
            "Received CAN frame: ID=0x{:X}, len={}",
            rover_frame.id, rover_frame.len
        );
        return Ok(rover_frame);
    }
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: RoverFrame) -> Result<(), CanError> {
        let can_frame = to_can_frame(&frame)?;
        self.socket.write_frame(&can_frame).map_err(map_io_error)?;
        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    fn receive(&mut self) -> Result<RoverFrame, CanError> {
        read_data_frame(&self.socket)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!("Failed to set receive timeout: {}", e);
        }
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<RoverFrame, CanError> {
        let old_timeout = self.read_timeout;
        self.set_read_timeout(timeout)?;
        let result = self.receive();
        let _ = self.set_read_timeout(old_timeout);
        result
    }

    fn send_timeout(&mut self, frame: RoverFrame, timeout: Duration) -> Result<(), CanError> {
        self.socket.set_write_timeout(timeout).map_err(CanError::Io)?;
        let result = self.send(frame);
        if let Err(e) = self.socket.set_write_timeout(None) {
            warn!("Failed to restore write timeout: {}", e);
        }
        result
    }
}

impl crate::SplittableAdapter for SocketCanAdapter {
    type RxAdapter = SocketCanRxAdapter;
    type TxAdapter = SocketCanTxAdapter;

    /// 分离为独立的 RX 和 TX 适配器
    ///
    /// 两半通过 `try_clone()`（`dup()`）共享同一个打开文件描述，因此只能用
    /// `SO_RCVTIMEO` / `SO_SNDTIMEO` 控制超时，不能切换非阻塞模式。
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        let rx = SocketCanRxAdapter::new(&self.socket, self.read_timeout)?;
        let tx = SocketCanTxAdapter::new(&self.socket)?;
        trace!(
            "SocketCanAdapter split into RX and TX adapters (interface: {})",
            self.interface
        );
        Ok((rx, tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversion_extended() {
        let frame = RoverFrame::new_extended(0x18C4D1D0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let can_frame = to_can_frame(&frame).unwrap();
        assert!(can_frame.is_extended());
        assert_eq!(can_frame.raw_id(), 0x18C4D1D0);

        let back = from_can_frame(&can_frame, 99);
        assert_eq!(back.id, frame.id);
        assert_eq!(back.data, frame.data);
        assert_eq!(back.len, 8);
        assert!(back.is_extended);
        assert_eq!(back.timestamp_us, 99);
    }

    #[test]
    fn test_frame_conversion_standard() {
        let frame = RoverFrame::new_standard(0x123, &[0xAA]);
        let can_frame = to_can_frame(&frame).unwrap();
        assert!(!can_frame.is_extended());
        assert_eq!(from_can_frame(&can_frame, 0).data_slice(), &[0xAA]);
    }

    #[test]
    fn test_map_io_error() {
        assert!(matches!(
            map_io_error(io::Error::from(io::ErrorKind::WouldBlock)),
            CanError::Timeout
        ));
        assert!(map_io_error(io::Error::from_raw_os_error(libc::ENODEV)).is_fatal());
        assert!(matches!(
            map_io_error(io::Error::other("x")),
            CanError::Io(_)
        ));
    }

    #[test]
    fn test_open_missing_interface_fails() {
        let result = SocketCanAdapter::new("rovernope0");
        assert!(result.is_err());
    }
}
