//! CAN 传输层
//!
//! `CanTransport` 持有总线句柄，管理连接生命周期：
//!
//! ```text
//! Disconnected ──connect()──> Connected { listening on/off, periodic-send on/off }
//!      ^                              │
//!      └────────disconnect()──────────┘
//! ```
//!
//! - 接收线程：以有限超时轮询一帧，按注册顺序调用所有处理器
//! - 周期发送线程：按间隔重发当前工作帧，间隔等待可被停止信号打断
//! - 单次发送：与周期发送共享 TX 半边，带短超时

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use rover_protocol::RoverFrame;
use tracing::{debug, error, info, trace, warn};

use crate::hooks::{FrameHandler, HandlerRegistry};
use crate::join::JoinTimeout;
use crate::{AdapterFactory, BoxedRxAdapter, BoxedTxAdapter, CanError};

const STATUS_DISCONNECTED: &str = "CAN bus disconnected.";

/// 传输层时序参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTiming {
    /// 接收线程单次轮询超时
    pub receive_timeout: Duration,
    /// 单帧发送超时
    pub send_timeout: Duration,
    /// 停止线程时的 join 上限，超时的线程视为泄漏
    pub join_timeout: Duration,
}

impl Default for TransportTiming {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(100),
            send_timeout: Duration::from_millis(20),
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// 周期发送的帧来源
pub enum FrameSource {
    /// 每次重发同一帧
    Fixed(RoverFrame),
    /// 每个周期调用一次生成新帧，返回 `None` 时跳过本周期
    Generator(Box<dyn FnMut() -> Option<RoverFrame> + Send>),
}

impl FrameSource {
    fn next_frame(&mut self) -> Option<RoverFrame> {
        match self {
            FrameSource::Fixed(frame) => Some(*frame),
            FrameSource::Generator(generate) => generate(),
        }
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameSource::Fixed(frame) => f.debug_tuple("Fixed").field(frame).finish(),
            FrameSource::Generator(_) => f.write_str("Generator"),
        }
    }
}

/// 周期发送线程的工作状态，由外部 `update_*` 修改
struct PeriodicWork {
    source: FrameSource,
    interval: Duration,
}

struct PeriodicSender {
    stop_tx: Sender<()>,
    work: Arc<Mutex<PeriodicWork>>,
    handle: JoinHandle<()>,
}

struct Listener {
    running: Arc<AtomicBool>,
    handle: JoinHandle<BoxedRxAdapter>,
}

/// 已打开的总线资源
struct Link {
    tx: Arc<Mutex<BoxedTxAdapter>>,
    /// 接收线程未运行时由此持有
    idle_rx: Option<BoxedRxAdapter>,
    listener: Option<Listener>,
    sender: Option<PeriodicSender>,
}

/// CAN 传输层
///
/// 所有方法取 `&self`，可在多个线程间共享（`Arc<CanTransport>`）。
///
/// # 示例
///
/// ```no_run
/// use rover_can::{CanBackend, CanConfig, CanTransport, RoverFrame};
/// use std::time::Duration;
///
/// let transport = CanTransport::new(CanConfig::new(CanBackend::Vcan, "vcan0", 500_000));
/// if transport.connect() {
///     let frame = RoverFrame::new_extended(0x18C4D1D0, &[0; 8]);
///     transport.start_periodic_send(frame, Duration::from_millis(20));
///     // ...
///     transport.disconnect();
/// }
/// ```
pub struct CanTransport {
    factory: Box<dyn AdapterFactory>,
    timing: TransportTiming,
    link: Mutex<Option<Link>>,
    handlers: Arc<RwLock<HandlerRegistry>>,
    connected: Arc<AtomicBool>,
    status: Arc<Mutex<String>>,
}

impl CanTransport {
    pub fn new(factory: impl AdapterFactory + 'static) -> Self {
        Self::with_timing(factory, TransportTiming::default())
    }

    pub fn with_timing(factory: impl AdapterFactory + 'static, timing: TransportTiming) -> Self {
        Self {
            factory: Box::new(factory),
            timing,
            link: Mutex::new(None),
            handlers: Arc::new(RwLock::new(HandlerRegistry::new())),
            connected: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(STATUS_DISCONNECTED.to_string())),
        }
    }

    pub fn timing(&self) -> TransportTiming {
        self.timing
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// 连接状态描述
    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    // ------------------------------------------------------------------------
    // 生命周期
    // ------------------------------------------------------------------------

    /// 打开总线并启动接收线程
    ///
    /// 已连接时直接返回 `true`。失败时保持断开状态，不暴露半连接资源。
    pub fn connect(&self) -> bool {
        if self.is_connected() {
            debug!("Already connected to {}", self.factory.describe());
            return true;
        }

        // 上一次连接因设备丢失而残留的资源
        if self.link.lock().is_some() {
            self.disconnect();
        }

        let (rx, tx) = match self.factory.open() {
            Ok(halves) => halves,
            Err(e) => {
                error!("Error connecting to CAN bus: {}", e);
                self.set_status(format!("Error connecting to CAN bus: {}", e));
                return false;
            },
        };

        *self.link.lock() = Some(Link {
            tx: Arc::new(Mutex::new(tx)),
            idle_rx: Some(rx),
            listener: None,
            sender: None,
        });
        self.connected.store(true, Ordering::Release);

        let description = self.factory.describe();
        self.set_status(format!("Connected to {}.", description));
        info!("Connected to {}", description);

        self.start_listening();
        true
    }

    /// 停止所有线程并释放总线；未连接时为空操作
    pub fn disconnect(&self) {
        let link = self.link.lock().take();
        let Some(mut link) = link else {
            debug!("CAN bus is not connected");
            self.connected.store(false, Ordering::Release);
            return;
        };

        if let Some(sender) = link.sender.take() {
            self.join_sender(sender);
        }
        if let Some(listener) = link.listener.take() {
            // 适配器随 link 一起释放
            let _ = self.join_listener(listener);
        }
        drop(link);

        self.connected.store(false, Ordering::Release);
        self.set_status(STATUS_DISCONNECTED);
        info!("CAN bus disconnected");
    }

    // ------------------------------------------------------------------------
    // 接收
    // ------------------------------------------------------------------------

    /// 注册接收处理器，按注册顺序调用
    pub fn register_handler(&self, handler: impl FrameHandler + 'static) {
        self.handlers.write().add(Arc::new(handler));
    }

    pub fn clear_handlers(&self) {
        self.handlers.write().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// 启动接收线程；已在监听时返回 `true`
    pub fn start_listening(&self) -> bool {
        let mut guard = self.link.lock();
        let Some(link) = guard.as_mut() else {
            warn!("Not connected to CAN bus");
            return false;
        };
        if link.listener.is_some() {
            debug!("Already listening for CAN frames");
            return true;
        }
        let Some(rx) = link.idle_rx.take() else {
            warn!("CAN RX adapter is unavailable");
            return false;
        };

        let running = Arc::new(AtomicBool::new(true));
        let handlers = self.handlers.clone();
        let connected = self.connected.clone();
        let status = self.status.clone();
        let running_clone = running.clone();
        let receive_timeout = self.timing.receive_timeout;

        let handle = spawn(move || {
            rx_loop(rx, handlers, running_clone, connected, status, receive_timeout)
        });

        link.listener = Some(Listener { running, handle });
        info!("Listening for CAN frames");
        true
    }

    pub fn stop_listening(&self) {
        let listener = self.link.lock().as_mut().and_then(|link| link.listener.take());
        let Some(listener) = listener else {
            return;
        };

        let rx = self.join_listener(listener);
        if let Some(rx) = rx
            && let Some(link) = self.link.lock().as_mut()
        {
            link.idle_rx = Some(rx);
        }
        info!("Stopped listening for CAN frames");
    }

    pub fn is_listening(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .and_then(|link| link.listener.as_ref())
            .is_some_and(|l| l.running.load(Ordering::Acquire))
    }

    /// 同步接收一帧
    ///
    /// 仅在接收线程未运行时可用；超时、出错或未连接时返回 `None`。
    pub fn receive(&self, timeout: Duration) -> Option<RoverFrame> {
        let rx = {
            let mut guard = self.link.lock();
            let Some(link) = guard.as_mut() else {
                warn!("Not connected to CAN bus");
                return None;
            };
            if link.listener.is_some() {
                warn!("Synchronous receive is unavailable while the listener is running");
                return None;
            }
            link.idle_rx.take()
        };
        let mut rx = rx?;

        let result = rx.receive_timeout(timeout);

        if let Some(link) = self.link.lock().as_mut() {
            link.idle_rx = Some(rx);
        }

        match result {
            Ok(frame) => Some(frame),
            Err(CanError::Timeout) => None,
            Err(e) => {
                error!("Error receiving CAN frame: {}", e);
                None
            },
        }
    }

    // ------------------------------------------------------------------------
    // 发送
    // ------------------------------------------------------------------------

    fn tx_handle(&self) -> Option<Arc<Mutex<BoxedTxAdapter>>> {
        self.link.lock().as_ref().map(|link| link.tx.clone())
    }

    /// 单次发送，失败只记录日志并返回 `false`
    pub fn send(&self, frame: RoverFrame) -> bool {
        self.send_with(|| frame)
    }

    /// 在持有 TX 锁期间构造并发送一帧
    ///
    /// 与周期发送线程互斥：帧的构造顺序即上总线的顺序。未连接时不会调用 `build`。
    pub fn send_with(&self, build: impl FnOnce() -> RoverFrame) -> bool {
        if !self.is_connected() {
            warn!("Not connected to CAN bus, dropping frame");
            return false;
        }
        let Some(tx) = self.tx_handle() else {
            return false;
        };

        let mut tx = tx.lock();
        let frame = build();
        match tx.send_timeout(frame, self.timing.send_timeout) {
            Ok(()) => {
                trace!("Sent CAN frame 0x{:X}", frame.id);
                true
            },
            Err(e) => {
                error!("Error sending CAN frame 0x{:X}: {}", frame.id, e);
                false
            },
        }
    }

    /// 以固定间隔重发一帧
    pub fn start_periodic_send(&self, frame: RoverFrame, interval: Duration) -> bool {
        self.start_periodic_with(FrameSource::Fixed(frame), interval)
    }

    /// 以固定间隔发送 `source` 产生的帧
    ///
    /// 未连接或已有周期发送在运行时返回 `false`。
    pub fn start_periodic_with(&self, source: FrameSource, interval: Duration) -> bool {
        let mut guard = self.link.lock();
        let Some(link) = guard.as_mut() else {
            warn!("Not connected to CAN bus");
            return false;
        };
        if link.sender.is_some() {
            warn!("Periodic CAN send is already running");
            return false;
        }

        let work = Arc::new(Mutex::new(PeriodicWork { source, interval }));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let tx = link.tx.clone();
        let work_clone = work.clone();
        let send_timeout = self.timing.send_timeout;

        let handle = spawn(move || {
            let mut failing = false;
            loop {
                // 取帧与发送在同一个 TX 临界区内，与 send_with 交错时顺序不乱
                let mut tx_guard = tx.lock();
                let (frame, interval) = {
                    let mut work = work_clone.lock();
                    (work.source.next_frame(), work.interval)
                };

                if let Some(frame) = frame {
                    let result = tx_guard.send_timeout(frame, send_timeout);
                    match result {
                        Ok(()) => {
                            if failing {
                                info!("Periodic CAN send recovered");
                                failing = false;
                            }
                        },
                        Err(e) if !failing => {
                            warn!("Periodic CAN send of 0x{:X} failed: {}", frame.id, e);
                            failing = true;
                        },
                        Err(e) => trace!("Periodic CAN send still failing: {}", e),
                    }
                }
                drop(tx_guard);

                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            trace!("Periodic send thread exited");
        });

        link.sender = Some(PeriodicSender {
            stop_tx,
            work,
            handle,
        });
        info!("Started periodic CAN send every {:?}", interval);
        true
    }

    /// 替换周期发送的工作帧；未在周期发送时返回 `false`
    pub fn update_frame(&self, frame: RoverFrame) -> bool {
        self.with_periodic_work(|work| work.source = FrameSource::Fixed(frame))
    }

    /// 修改周期发送间隔，下一次等待生效
    pub fn update_interval(&self, interval: Duration) -> bool {
        self.with_periodic_work(|work| work.interval = interval)
    }

    fn with_periodic_work(&self, update: impl FnOnce(&mut PeriodicWork)) -> bool {
        let work = self
            .link
            .lock()
            .as_ref()
            .and_then(|link| link.sender.as_ref())
            .map(|sender| sender.work.clone());
        match work {
            Some(work) => {
                update(&mut work.lock());
                true
            },
            None => false,
        }
    }

    pub fn is_sending(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.sender.is_some())
    }

    /// 停止周期发送；未在发送时为空操作
    pub fn stop_periodic_send(&self) {
        let sender = self.link.lock().as_mut().and_then(|link| link.sender.take());
        if let Some(sender) = sender {
            self.join_sender(sender);
            info!("Stopped periodic CAN send");
        }
    }

    // ------------------------------------------------------------------------
    // 线程回收
    // ------------------------------------------------------------------------

    fn join_sender(&self, sender: PeriodicSender) {
        let _ = sender.stop_tx.try_send(());
        if let Err(e) = sender.handle.join_timeout(self.timing.join_timeout) {
            error!("Periodic send thread was not reclaimed: {}", e);
        }
    }

    fn join_listener(&self, listener: Listener) -> Option<BoxedRxAdapter> {
        listener.running.store(false, Ordering::Release);
        match listener.handle.join_timeout(self.timing.join_timeout) {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!("RX thread was not reclaimed: {}", e);
                None
            },
        }
    }
}

impl Drop for CanTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn rx_loop(
    mut rx: BoxedRxAdapter,
    handlers: Arc<RwLock<HandlerRegistry>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    status: Arc<Mutex<String>>,
    receive_timeout: Duration,
) -> BoxedRxAdapter {
    if let Err(e) = rx.set_receive_timeout(receive_timeout) {
        warn!("RX thread: failed to set receive timeout: {}", e);
    }

    loop {
        if !running.load(Ordering::Acquire) {
            trace!("RX thread: running flag is false, exiting");
            break;
        }

        match rx.receive() {
            Ok(frame) => {
                handlers.read().dispatch(&frame);
            },
            Err(CanError::Timeout) => continue,
            Err(e) if e.is_fatal() => {
                error!("RX thread: fatal CAN error, marking bus disconnected: {}", e);
                connected.store(false, Ordering::Release);
                *status.lock() = format!("CAN bus connection lost: {}", e);
                break;
            },
            Err(e) => {
                warn!("RX thread: CAN receive error: {}", e);
            },
        }
    }

    running.store(false, Ordering::Release);
    rx
}
