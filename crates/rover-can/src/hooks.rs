//! 接收帧处理器
//!
//! 接收线程按注册顺序依次调用所有处理器。单个处理器返回错误或 panic 时
//! 只记录日志，不影响后续处理器，也不终止接收线程。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use rover_protocol::RoverFrame;
use tracing::{error, warn};

/// 处理器返回的错误
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// 帧处理器
///
/// 在接收线程中同步调用，应尽快返回。
///
/// # 示例
///
/// ```rust
/// use rover_can::{HandlerRegistry, RoverFrame};
/// use std::sync::Arc;
///
/// let mut registry = HandlerRegistry::new();
/// registry.add(Arc::new(|frame: &RoverFrame| -> Result<(), rover_can::HandlerError> {
///     println!("0x{:X}", frame.id);
///     Ok(())
/// }));
/// assert_eq!(registry.len(), 1);
/// ```
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: &RoverFrame) -> Result<(), HandlerError>;
}

impl<F> FrameHandler for F
where
    F: Fn(&RoverFrame) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_frame(&self, frame: &RoverFrame) -> Result<(), HandlerError> {
        self(frame)
    }
}

/// 处理器注册表
///
/// 本身不加锁，由 `CanTransport` 放在 `RwLock` 中共享给接收线程。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn FrameHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn add(&mut self, handler: Arc<dyn FrameHandler>) {
        self.handlers.push(handler);
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 依次调用所有处理器，返回失败个数
    pub fn dispatch(&self, frame: &RoverFrame) -> usize {
        let mut failures = 0;
        for (index, handler) in self.handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler.on_frame(frame))) {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(
                        "Frame handler #{} failed on ID=0x{:X}: {}",
                        index, frame.id, e
                    );
                },
                Err(_) => {
                    failures += 1;
                    error!("Frame handler #{} panicked on ID=0x{:X}", index, frame.id);
                },
            }
        }
        failures
    }
}
