//! SocketCAN 适配器分离实现
//!
//! RX 与 TX 各持有一个 `try_clone()` 得到的 socket，可在不同线程中并发使用。
//!
//! `dup()` 出来的 FD 共享文件状态标志：**不要调用 `set_nonblocking()`**，
//! 否则另一半也会变成非阻塞。超时一律使用 `SO_RCVTIMEO` / `SO_SNDTIMEO`。

use super::{map_io_error, read_data_frame, to_can_frame};
use crate::{CanError, RoverFrame, RxAdapter, TxAdapter};
use socketcan::{CanSocket, Socket};
use std::os::fd::AsFd;
use std::time::Duration;
use tracing::{trace, warn};

/// 只读适配器（接收线程持有）
pub struct SocketCanRxAdapter {
    socket: CanSocket,
    read_timeout: Duration,
}

impl SocketCanRxAdapter {
    pub fn new(socket: &CanSocket, read_timeout: Duration) -> Result<Self, CanError> {
        let rx_socket = socket.as_fd().try_clone_to_owned().map(CanSocket::from).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "Failed to clone SocketCAN socket for RX: {}",
                e
            )))
        })?;
        rx_socket.set_read_timeout(read_timeout).map_err(CanError::Io)?;

        Ok(Self {
            socket: rx_socket,
            read_timeout,
        })
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

impl RxAdapter for SocketCanRxAdapter {
    fn receive(&mut self) -> Result<RoverFrame, CanError> {
        read_data_frame(&self.socket)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        if timeout == self.read_timeout {
            return Ok(());
        }
        // SO_RCVTIMEO 为 0 表示无限阻塞，最小取 1ms
        let effective = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(effective).map_err(CanError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }
}

/// 只写适配器（发送路径共享）
pub struct SocketCanTxAdapter {
    socket: CanSocket,
    write_timeout: Option<Duration>,
}

impl SocketCanTxAdapter {
    pub fn new(socket: &CanSocket) -> Result<Self, CanError> {
        let tx_socket = socket.as_fd().try_clone_to_owned().map(CanSocket::from).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "Failed to clone SocketCAN socket for TX: {}",
                e
            )))
        })?;

        Ok(Self {
            socket: tx_socket,
            write_timeout: None,
        })
    }
}

impl TxAdapter for SocketCanTxAdapter {
    fn send(&mut self, frame: RoverFrame) -> Result<(), CanError> {
        let can_frame = to_can_frame(&frame)?;
        self.socket.write_frame(&can_frame).map_err(map_io_error)?;
        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    fn send_timeout(&mut self, frame: RoverFrame, timeout: Duration) -> Result<(), CanError> {
        let timeout = timeout.max(Duration::from_millis(1));
        if self.write_timeout != Some(timeout) {
            match self.socket.set_write_timeout(timeout) {
                Ok(()) => self.write_timeout = Some(timeout),
                Err(e) => warn!("Failed to set write timeout: {}", e),
            }
        }
        self.send(frame)
    }
}
