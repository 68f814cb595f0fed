//! 内存 broker
//!
//! 不依赖网络的会话实现，用于客户端和上层桥接逻辑的测试：
//! 记录发布和订阅、注入入站消息，并能模拟打开失败、连接被拒、断线与重连。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::{BoxedSession, BrokerConnector, BrokerEvent, BrokerSession, MqttError};

#[derive(Default)]
struct BrokerState {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    /// 当前订阅
    subscriptions: Mutex<Vec<String>>,
    /// 每个主题收到的 SUBSCRIBE 次数
    subscribe_log: Mutex<BTreeMap<String, usize>>,
    /// 当前会话的事件出口
    events: Mutex<Option<Sender<BrokerEvent>>>,
    online: AtomicBool,
    fail_open: AtomicBool,
    refuse: AtomicBool,
    fail_publish: AtomicBool,
    opens: AtomicUsize,
}

impl BrokerState {
    fn emit(&self, event: BrokerEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn check_online(&self) -> Result<(), MqttError> {
        if self.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }
}

/// 内存 broker 句柄，可克隆；所有克隆共享同一个 broker
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有发布记录 `(topic, payload)`，按发布顺序
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn clear_published(&self) {
        self.state.published.lock().clear();
    }

    /// 等待 `topic` 上的发布数达到 `count`
    pub fn wait_for_publishes(&self, topic: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.published_on(topic).len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.published_on(topic).len() >= count
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().clone()
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.state
            .subscribe_log
            .lock()
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// 向当前会话投递一条入站消息；无会话时返回 `false`
    pub fn inject(&self, topic: &str, payload: Vec<u8>) -> bool {
        self.state.emit(BrokerEvent::Message {
            topic: topic.to_string(),
            payload,
        })
    }

    /// 模拟网络断开：会话保留，但发布失败直到恢复
    pub fn drop_connection(&self, reason: &str) {
        self.state.online.store(false, Ordering::Release);
        self.state
            .emit(BrokerEvent::Disconnected(reason.to_string()));
    }

    /// 模拟自动重连成功
    pub fn restore_connection(&self) {
        self.state.online.store(true, Ordering::Release);
        self.state.emit(BrokerEvent::Connected);
    }

    pub fn set_open_failure(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::Release);
    }

    /// 打开成功但 broker 拒绝连接
    pub fn set_refuse_connection(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::Release);
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::Release);
    }

    /// `BrokerConnector::open` 成功次数
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::Acquire)
    }
}

impl BrokerConnector for MockBroker {
    fn open(&self, events: Sender<BrokerEvent>) -> Result<BoxedSession, MqttError> {
        if self.state.fail_open.load(Ordering::Acquire) {
            return Err(MqttError::Connect {
                address: self.describe(),
                reason: "mock broker unavailable".to_string(),
            });
        }
        self.state.opens.fetch_add(1, Ordering::AcqRel);
        *self.state.events.lock() = Some(events);

        if self.state.refuse.load(Ordering::Acquire) {
            self.state.online.store(false, Ordering::Release);
            self.state.emit(BrokerEvent::Disconnected(
                "connection refused: NotAuthorized".to_string(),
            ));
        } else {
            self.state.online.store(true, Ordering::Release);
            self.state.emit(BrokerEvent::Connected);
        }

        Ok(Box::new(MockSession {
            state: self.state.clone(),
        }))
    }

    fn describe(&self) -> String {
        "mock:1883".to_string()
    }
}

struct MockSession {
    state: Arc<BrokerState>,
}

impl BrokerSession for MockSession {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.state.check_online()?;
        if self.state.fail_publish.load(Ordering::Acquire) {
            return Err(MqttError::Client("simulated publish failure".to_string()));
        }
        self.state
            .published
            .lock()
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.state.check_online()?;
        let mut subscriptions = self.state.subscriptions.lock();
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }
        *self
            .state
            .subscribe_log
            .lock()
            .entry(topic.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.state.subscriptions.lock().retain(|t| t != topic);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        self.state.online.store(false, Ordering::Release);
        // 丢弃事件出口，事件线程随之退出
        self.state.events.lock().take();
        Ok(())
    }
}
