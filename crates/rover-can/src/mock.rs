//! 内存 CAN 总线
//!
//! 不依赖硬件的适配器，用于传输层和上层桥接逻辑的测试：
//! 记录所有发出的帧、注入接收帧，并能模拟发送失败、设备丢失和打开失败。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use crate::{
    AdapterFactory, BoxedRxAdapter, BoxedTxAdapter, CanAdapter, CanDeviceError,
    CanDeviceErrorKind, CanError, RoverFrame, RxAdapter, SplittableAdapter, TxAdapter,
};

#[derive(Default)]
struct BusState {
    sent: Mutex<Vec<RoverFrame>>,
    fail_send: AtomicBool,
    device_lost: AtomicBool,
    fail_open: AtomicBool,
    opens: AtomicUsize,
}

impl BusState {
    fn check_device(&self) -> Result<(), CanError> {
        if self.device_lost.load(Ordering::Acquire) {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NoDevice,
                "mock CAN device lost",
            )));
        }
        Ok(())
    }

    fn record(&self, frame: RoverFrame) -> Result<(), CanError> {
        self.check_device()?;
        if self.fail_send.load(Ordering::Acquire) {
            return Err(CanError::Io(std::io::Error::other("simulated send failure")));
        }
        self.sent.lock().push(frame);
        Ok(())
    }
}

/// 内存总线句柄，可克隆；所有克隆共享同一条总线
#[derive(Clone)]
pub struct MockCanBus {
    state: Arc<BusState>,
    inject_tx: Sender<RoverFrame>,
    inject_rx: Receiver<RoverFrame>,
}

impl Default for MockCanBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCanBus {
    pub fn new() -> Self {
        let (inject_tx, inject_rx) = unbounded();
        Self {
            state: Arc::new(BusState::default()),
            inject_tx,
            inject_rx,
        }
    }

    /// 注入一帧，供接收端读取
    pub fn inject(&self, frame: RoverFrame) {
        let _ = self.inject_tx.send(frame);
    }

    /// 已发出的帧（按发送顺序）
    pub fn sent_frames(&self) -> Vec<RoverFrame> {
        self.state.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.sent.lock().len()
    }

    pub fn clear_sent(&self) {
        self.state.sent.lock().clear();
    }

    /// 等待发送帧数达到 `count`
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.sent_count() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.sent_count() >= count
    }

    pub fn set_send_failure(&self, fail: bool) {
        self.state.fail_send.store(fail, Ordering::Release);
    }

    /// 模拟设备拔出：之后的收发都返回致命错误
    pub fn lose_device(&self) {
        self.state.device_lost.store(true, Ordering::Release);
    }

    pub fn restore_device(&self) {
        self.state.device_lost.store(false, Ordering::Release);
    }

    pub fn set_open_failure(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::Release);
    }

    /// `AdapterFactory::open` 成功次数
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::Acquire)
    }

    pub fn adapter(&self) -> MockCanAdapter {
        MockCanAdapter {
            state: self.state.clone(),
            rx: self.inject_rx.clone(),
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl AdapterFactory for MockCanBus {
    fn open(&self) -> Result<(BoxedRxAdapter, BoxedTxAdapter), CanError> {
        if self.state.fail_open.load(Ordering::Acquire) {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NotFound,
                "mock CAN bus unavailable",
            )));
        }
        self.state.check_device()?;
        self.state.opens.fetch_add(1, Ordering::AcqRel);
        crate::split_boxed(self.adapter())
    }

    fn describe(&self) -> String {
        "CAN bus mock on channel mock0 with bitrate 500000 bps".to_string()
    }
}

/// 未分离的 mock 适配器
pub struct MockCanAdapter {
    state: Arc<BusState>,
    rx: Receiver<RoverFrame>,
    read_timeout: Duration,
}

fn receive_from(
    state: &BusState,
    rx: &Receiver<RoverFrame>,
    timeout: Duration,
) -> Result<RoverFrame, CanError> {
    state.check_device()?;
    match rx.recv_timeout(timeout) {
        Ok(frame) => Ok(frame),
        Err(RecvTimeoutError::Timeout) => {
            state.check_device()?;
            Err(CanError::Timeout)
        },
        Err(RecvTimeoutError::Disconnected) => Err(CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NoDevice,
            "mock CAN bus dropped",
        ))),
    }
}

impl CanAdapter for MockCanAdapter {
    fn send(&mut self, frame: RoverFrame) -> Result<(), CanError> {
        self.state.record(frame)
    }

    fn receive(&mut self) -> Result<RoverFrame, CanError> {
        receive_from(&self.state, &self.rx, self.read_timeout)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }
}

impl SplittableAdapter for MockCanAdapter {
    type RxAdapter = MockRxAdapter;
    type TxAdapter = MockTxAdapter;

    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        Ok((
            MockRxAdapter {
                state: self.state.clone(),
                rx: self.rx,
                read_timeout: self.read_timeout,
            },
            MockTxAdapter { state: self.state },
        ))
    }
}

pub struct MockRxAdapter {
    state: Arc<BusState>,
    rx: Receiver<RoverFrame>,
    read_timeout: Duration,
}

impl RxAdapter for MockRxAdapter {
    fn receive(&mut self) -> Result<RoverFrame, CanError> {
        receive_from(&self.state, &self.rx, self.read_timeout)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.read_timeout = timeout;
        Ok(())
    }
}

pub struct MockTxAdapter {
    state: Arc<BusState>,
}

impl TxAdapter for MockTxAdapter {
    fn send(&mut self, frame: RoverFrame) -> Result<(), CanError> {
        self.state.record(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32) -> RoverFrame {
        RoverFrame::new_extended(id, &[0; 8])
    }

    #[test]
    fn test_inject_and_receive() {
        let bus = MockCanBus::new();
        let mut adapter = bus.adapter();
        bus.inject(frame(0x1));
        assert_eq!(adapter.receive().unwrap().id, 0x1);
        assert!(matches!(
            adapter.receive_timeout(Duration::from_millis(5)),
            Err(CanError::Timeout)
        ));
    }

    #[test]
    fn test_send_recorded_and_failure() {
        let bus = MockCanBus::new();
        let mut adapter = bus.adapter();
        adapter.send(frame(0x2)).unwrap();
        bus.set_send_failure(true);
        assert!(matches!(adapter.send(frame(0x3)), Err(CanError::Io(_))));
        assert_eq!(bus.sent_count(), 1);
    }

    #[test]
    fn test_device_loss_is_fatal() {
        let bus = MockCanBus::new();
        let (mut rx, mut tx) = bus.open().unwrap();
        bus.lose_device();
        assert!(rx.receive().unwrap_err().is_fatal());
        assert!(tx.send(frame(0x4)).unwrap_err().is_fatal());
        assert!(bus.open().is_err());
    }

    #[test]
    fn test_open_failure() {
        let bus = MockCanBus::new();
        bus.set_open_failure(true);
        assert!(bus.open().is_err());
        assert_eq!(bus.open_count(), 0);
        bus.set_open_failure(false);
        assert!(bus.open().is_ok());
        assert_eq!(bus.open_count(), 1);
    }
}
