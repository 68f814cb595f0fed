//! 接口状态检查与 bring-up
//!
//! 状态来自 `/sys/class/net/<iface>/flags`；bring-up 调用系统 `ip` 命令。

use crate::{CanDeviceError, CanDeviceErrorKind, CanError};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{info, trace};

/// IFNAMSIZ - 1
const MAX_IFACE_NAME_LEN: usize = 15;

const SYSFS_NET: &str = "/sys/class/net";

/// 关闭接口后等待
const DOWN_SETTLE: Duration = Duration::from_millis(500);
/// 启动接口后等待
const UP_SETTLE: Duration = Duration::from_secs(1);

fn not_found(message: String) -> CanError {
    CanError::Device(CanDeviceError::new(CanDeviceErrorKind::NotFound, message))
}

fn valid_name(interface: &str) -> bool {
    !interface.is_empty()
        && interface.len() <= MAX_IFACE_NAME_LEN
        && !interface.contains(['/', '\0'])
        && interface != "."
        && interface != ".."
}

/// 解析 sysfs 中的 `0x1003` 形式标志位
fn parse_flags(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    u32::from_str_radix(hex, 16).ok()
}

/// 检查接口是否存在且处于 UP 状态
///
/// - `Ok(true)`: 存在且 UP
/// - `Ok(false)`: 存在但 DOWN
/// - `Err(CanError::Device)`: 不存在或名称非法
pub fn check_interface_status(interface: &str) -> Result<bool, CanError> {
    if !valid_name(interface) {
        return Err(not_found(format!(
            "Invalid interface name '{}' (1..={} characters, no '/')",
            interface, MAX_IFACE_NAME_LEN
        )));
    }

    let path: PathBuf = [SYSFS_NET, interface, "flags"].iter().collect();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(not_found(format!(
                "CAN interface '{}' does not exist. Please create it first:\n  sudo ip link add dev {} type can",
                interface, interface
            )));
        },
        Err(e) => return Err(CanError::Io(e)),
    };

    let flags = parse_flags(&raw).ok_or_else(|| {
        CanError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected flags '{}' in {}", raw.trim(), path.display()),
        ))
    })?;
    let is_up = (flags & libc::IFF_UP as u32) != 0;

    trace!("Interface '{}' flags 0x{:x}, up: {}", interface, flags, is_up);
    Ok(is_up)
}

/// `ip link` 命令行
fn ip_link_args(channel: &str, up: Option<u32>) -> Vec<String> {
    let mut args: Vec<String> = ["ip", "link", "set", channel]
        .iter()
        .map(|s| s.to_string())
        .collect();
    match up {
        None => args.push("down".to_string()),
        Some(bitrate) => {
            args.extend(["up", "type", "can", "bitrate"].iter().map(|s| s.to_string()));
            args.push(bitrate.to_string());
        },
    }
    args
}

fn run(args: &[String], use_sudo: bool) -> Result<(), CanError> {
    let (program, rest) = if use_sudo {
        ("sudo", args)
    } else {
        (args[0].as_str(), &args[1..])
    };

    let output = Command::new(program)
        .args(rest)
        .output()
        .map_err(|e| CanError::BringUp(format!("failed to run `{}`: {}", args.join(" "), e)))?;

    if !output.status.success() {
        return Err(CanError::BringUp(format!(
            "`{}` exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// 重新配置物理接口：先 down，再以指定波特率 up
pub fn bring_up(channel: &str, bitrate: u32, use_sudo: bool) -> Result<(), CanError> {
    run(&ip_link_args(channel, None), use_sudo)?;
    thread::sleep(DOWN_SETTLE);

    run(&ip_link_args(channel, Some(bitrate)), use_sudo)?;
    thread::sleep(UP_SETTLE);

    info!("CAN interface {} is up at {} bps", channel, bitrate);
    Ok(())
}
