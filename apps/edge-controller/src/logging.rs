//! 日志初始化：控制台 + 可选的每日轮转文件

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const DEFAULT_FILTER: &str = "edge_controller=info,rover_bridge=info,rover_can=info,rover_mqtt=info";

pub const LOG_FILE_NAME: &str = "edge_controller.log";

/// 过滤规则优先级：`--log-level` > `RUST_LOG` > 默认值
pub fn build_filter(log_level: Option<&str>) -> EnvFilter {
    if let Some(level) = log_level {
        match EnvFilter::try_new(level) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("Invalid --log-level '{}': {}. Falling back.", level, e),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// 安装全局 subscriber
///
/// 返回的 guard 必须存活到进程退出，否则文件中的尾部日志会丢失。
pub fn init(log_level: Option<&str>, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(log_level);
    let console = tracing_subscriber::fmt::layer().with_target(true);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_level_wins() {
        let filter = build_filter(Some("rover_can=trace"));
        assert_eq!(filter.to_string(), "rover_can=trace");
    }

    #[test]
    fn test_invalid_level_falls_back() {
        // 非法指令不会 panic
        let filter = build_filter(Some("rover_can=loud"));
        assert!(!filter.to_string().is_empty());
    }
}
