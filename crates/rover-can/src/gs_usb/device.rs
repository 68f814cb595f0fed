//! GS-USB 设备：枚举、配置与 bulk 收发

use std::time::Duration;

use rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::protocol::{
    BREQ_BITTIMING, BREQ_BT_CONST, BREQ_MODE, BT_CONST_SIZE, BitTiming, DeviceCapability,
    HostFrame, MODE_FLAGS_NORMAL, MODE_RESET, MODE_START, REQ_IN, REQ_OUT, compute_bit_timing,
    mode_request,
};

/// 已知的 gs_usb / candleLight 固件 VID:PID
const KNOWN_IDS: &[(u16, u16)] = &[(0x1D50, 0x606F), (0x1209, 0x2323), (0x1CD2, 0x606F)];

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// 一个 bulk IN 包的上限
const PACKET_BUF: usize = 512;

#[derive(Error, Debug)]
pub enum GsUsbError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("no GS-USB device found{}", serial_suffix(.serial))]
    NotFound { serial: Option<String> },

    #[error("short reply to request {request}: {actual} of {expected} bytes")]
    ShortReply {
        request: u8,
        expected: usize,
        actual: usize,
    },

    #[error("bitrate {bitrate} bps cannot be derived from a {clock_hz} Hz CAN clock")]
    UnsupportedBitrate { bitrate: u32, clock_hz: u32 },

    #[error("USB read timeout")]
    ReadTimeout,

    #[error("USB write timeout")]
    WriteTimeout,
}

fn serial_suffix(serial: &Option<String>) -> String {
    serial
        .as_ref()
        .map(|s| format!(" with serial number {}", s))
        .unwrap_or_default()
}

/// 已 claim 接口的设备句柄
///
/// 配置完成后以 `Arc` 在 RX/TX 两半之间共享；bulk 传输只需 `&self`。
pub struct GsUsbDevice {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    serial: Option<String>,
    claimed: bool,
}

fn is_gs_usb(vendor_id: u16, product_id: u16) -> bool {
    KNOWN_IDS.contains(&(vendor_id, product_id))
}

/// 第一个接口上的 bulk IN / OUT 端点
fn bulk_endpoints(device: &Device<GlobalContext>) -> Option<(u8, u8, u8)> {
    let config = device.config_descriptor(0).ok()?;
    let interface = config.interfaces().next()?.descriptors().next()?;
    let mut endpoint_in = None;
    let mut endpoint_out = None;
    for endpoint in interface.endpoint_descriptors() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        match endpoint.direction() {
            Direction::In => endpoint_in = endpoint_in.or(Some(endpoint.address())),
            Direction::Out => endpoint_out = endpoint_out.or(Some(endpoint.address())),
        }
    }
    Some((interface.interface_number(), endpoint_in?, endpoint_out?))
}

impl GsUsbDevice {
    /// 打开第一个匹配的设备；给定序列号时只匹配该设备
    pub fn open(serial: Option<&str>) -> Result<Self, GsUsbError> {
        for device in rusb::devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if !is_gs_usb(desc.vendor_id(), desc.product_id()) {
                continue;
            }
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(
                        "Skipping GS-USB device {:04x}:{:04x}: {}",
                        desc.vendor_id(),
                        desc.product_id(),
                        e
                    );
                    continue;
                },
            };
            let found_serial = handle.read_serial_number_string_ascii(&desc).ok();
            if let Some(wanted) = serial
                && found_serial.as_deref() != Some(wanted)
            {
                continue;
            }
            let Some((interface, endpoint_in, endpoint_out)) = bulk_endpoints(&device) else {
                debug!("GS-USB device without bulk endpoints, skipping");
                continue;
            };

            info!(
                "Found GS-USB device {:04x}:{:04x} (serial {})",
                desc.vendor_id(),
                desc.product_id(),
                found_serial.as_deref().unwrap_or("n/a")
            );
            return Ok(Self {
                handle,
                interface,
                endpoint_in,
                endpoint_out,
                serial: found_serial,
                claimed: false,
            });
        }
        Err(GsUsbError::NotFound {
            serial: serial.map(str::to_string),
        })
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn claim(&mut self) -> Result<(), GsUsbError> {
        if self.claimed {
            return Ok(());
        }
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        if self.handle.kernel_driver_active(self.interface).unwrap_or(false) {
            self.handle.detach_kernel_driver(self.interface)?;
        }
        self.handle.claim_interface(self.interface)?;
        self.claimed = true;

        // 上次异常退出可能留下 halt 状态
        for endpoint in [self.endpoint_in, self.endpoint_out] {
            if let Err(e) = self.handle.clear_halt(endpoint) {
                trace!("clear_halt(0x{:02x}) failed: {}", endpoint, e);
            }
        }
        Ok(())
    }

    fn control_out(&self, request: u8, payload: &[u8]) -> Result<(), GsUsbError> {
        self.handle
            .write_control(REQ_OUT, request, 0, 0, payload, CONTROL_TIMEOUT)?;
        Ok(())
    }

    fn capability(&self) -> Result<DeviceCapability, GsUsbError> {
        let mut buf = [0u8; BT_CONST_SIZE];
        let actual = self
            .handle
            .read_control(REQ_IN, BREQ_BT_CONST, 0, 0, &mut buf, CONTROL_TIMEOUT)?;
        DeviceCapability::from_bytes(&buf[..actual]).ok_or(GsUsbError::ShortReply {
            request: BREQ_BT_CONST,
            expected: BT_CONST_SIZE,
            actual,
        })
    }

    /// claim 接口、复位、设置波特率并启动
    pub fn start(&mut self, bitrate: u32) -> Result<BitTiming, GsUsbError> {
        self.claim()?;
        self.control_out(BREQ_MODE, &mode_request(MODE_RESET, 0))?;

        let cap = self.capability()?;
        let timing = compute_bit_timing(&cap, bitrate).ok_or(GsUsbError::UnsupportedBitrate {
            bitrate,
            clock_hz: cap.fclk_can,
        })?;
        self.control_out(BREQ_BITTIMING, &timing.to_bytes())?;
        self.control_out(BREQ_MODE, &mode_request(MODE_START, MODE_FLAGS_NORMAL))?;

        debug!(
            "GS-USB started: clock {} Hz, brp {}, {} quanta, sample point {}‰",
            cap.fclk_can,
            timing.brp,
            timing.quanta(),
            timing.sample_point()
        );
        Ok(timing)
    }

    pub fn write_frame(&self, frame: &HostFrame, timeout: Duration) -> Result<(), GsUsbError> {
        match self
            .handle
            .write_bulk(self.endpoint_out, &frame.to_bytes(), timeout)
        {
            Ok(_) => Ok(()),
            Err(rusb::Error::Timeout) => {
                // 超时后端点可能处于 stall
                if let Err(e) = self.handle.clear_halt(self.endpoint_out) {
                    warn!("Failed to clear OUT endpoint halt: {}", e);
                }
                Err(GsUsbError::WriteTimeout)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// 读一个 bulk 包，返回其中所有帧（含回显）
    pub fn read_packet(&self, timeout: Duration) -> Result<Vec<HostFrame>, GsUsbError> {
        let mut buf = [0u8; PACKET_BUF];
        match self.handle.read_bulk(self.endpoint_in, &mut buf, timeout) {
            Ok(len) => Ok(HostFrame::parse_packet(&buf[..len]).collect()),
            Err(rusb::Error::Timeout) => Err(GsUsbError::ReadTimeout),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for GsUsbDevice {
    fn drop(&mut self) {
        if self.claimed {
            let _ = self.control_out(BREQ_MODE, &mode_request(MODE_RESET, 0));
            let _ = self.handle.release_interface(self.interface);
            self.claimed = false;
            trace!("GS-USB interface released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_ids() {
        assert!(is_gs_usb(0x1D50, 0x606F));
        assert!(is_gs_usb(0x1209, 0x2323));
        assert!(!is_gs_usb(0x1D50, 0x0001));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            GsUsbError::NotFound { serial: None }.to_string(),
            "no GS-USB device found"
        );
        assert_eq!(
            GsUsbError::NotFound {
                serial: Some("0042".into())
            }
            .to_string(),
            "no GS-USB device found with serial number 0042"
        );
    }
}
