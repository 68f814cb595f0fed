//! MQTT 客户端
//!
//! `MqttClient` 持有 broker 会话，管理连接生命周期：
//!
//! ```text
//! Disconnected ──connect()──> Connected { subscriptions, publish loops per topic }
//!      ^                              │
//!      └────────disconnect()──────────┘
//! ```
//!
//! - 事件线程：处理 CONNACK（重连时自动重订阅）、断开通知和入站消息分发
//! - 发布线程：每个主题一个，按间隔发布当前载荷，间隔等待可被停止信号打断
//! - 每个主题的载荷由独立的锁保护，主题之间互不竞争

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use rover_can::JoinTimeout;
use tracing::{debug, error, info, trace, warn};

use crate::payload::{CallbackRegistry, MessageCallback, Payload};
use crate::{BrokerConnector, BrokerEvent, BrokerSession, MqttError};

const STATUS_DISCONNECTED: &str = "MQTT broker disconnected.";

/// 客户端时序参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTiming {
    /// 等待 broker 确认连接的上限
    pub connect_timeout: Duration,
    /// 停止线程时的 join 上限，超时的线程视为泄漏
    pub join_timeout: Duration,
    /// 事件线程单次轮询超时
    pub event_poll: Duration,
}

impl Default for ClientTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(2),
            event_poll: Duration::from_millis(100),
        }
    }
}

type AckSender = Sender<Result<(), String>>;

/// 事件线程与发布线程共享的状态
struct Shared {
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    connected: AtomicBool,
    status: Mutex<String>,
    subscriptions: Mutex<BTreeSet<String>>,
    callbacks: RwLock<CallbackRegistry>,
    /// connect() 等待 CONNACK 期间存在
    pending_ack: Mutex<Option<AckSender>>,
}

impl Shared {
    fn session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.session.read().clone()
    }

    fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    fn handle_event(&self, event: BrokerEvent, broker: &str) {
        match event {
            BrokerEvent::Connected => self.on_connected(broker),
            BrokerEvent::Disconnected(reason) => self.on_disconnected(&reason),
            BrokerEvent::Message { topic, payload } => self.on_message(&topic, &payload),
        }
    }

    fn on_connected(&self, broker: &str) {
        self.connected.store(true, Ordering::Release);

        match self.pending_ack.lock().take() {
            Some(ack) => {
                let _ = ack.send(Ok(()));
            },
            None => {
                info!("Reconnected to MQTT broker {}", broker);
                self.set_status(format!("Connected to MQTT broker {}.", broker));
            },
        }

        let topics: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        if topics.is_empty() {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        for topic in &topics {
            if let Err(e) = session.subscribe(topic) {
                error!("Failed to resubscribe to '{}': {}", topic, e);
            }
        }
        info!("Resubscribed to {} topic(s)", topics.len());
    }

    fn on_disconnected(&self, reason: &str) {
        if let Some(ack) = self.pending_ack.lock().take() {
            let _ = ack.send(Err(reason.to_string()));
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!("MQTT connection lost: {}", reason);
            self.set_status(format!("MQTT connection lost: {}", reason));
        } else {
            trace!("MQTT still disconnected: {}", reason);
        }
    }

    fn on_message(&self, topic: &str, bytes: &[u8]) {
        let payload = Payload::decode(bytes);
        let kind = payload.kind();
        // 释放锁后再执行回调，回调内可以调用客户端方法
        let dispatch = self.callbacks.read().resolve(topic, payload);
        match dispatch {
            Some(dispatch) => {
                dispatch.invoke(topic);
            },
            None => trace!("No {:?} callback for '{}', message dropped", kind, topic),
        }
    }
}

struct EventThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// 发布线程的工作状态，由 `update_publish_data` 修改
struct PublishSlot {
    payload: Payload,
    interval: Duration,
}

struct Publisher {
    stop_tx: Sender<()>,
    slot: Arc<Mutex<PublishSlot>>,
    handle: JoinHandle<()>,
}

/// MQTT 客户端
///
/// 所有方法取 `&self`，可在多个线程间共享（`Arc<MqttClient>`）。
///
/// # 示例
///
/// ```no_run
/// use rover_mqtt::{MessageCallback, MqttClient, MqttConfig};
/// use serde_json::json;
/// use std::time::Duration;
///
/// let client = MqttClient::new(MqttConfig::new("localhost", 1883, "Robot_01"));
/// if client.connect() {
///     client.subscribe(
///         "ROBOT/01/Control",
///         Some(MessageCallback::json(|topic, value| println!("{}: {}", topic, value))),
///     );
///     client.start_publishing("ROBOT/01/Status", json!({"Gear": 0}), Duration::from_millis(500));
///     // ...
///     client.disconnect();
/// }
/// ```
pub struct MqttClient {
    connector: Box<dyn BrokerConnector>,
    timing: ClientTiming,
    shared: Arc<Shared>,
    events: Mutex<Option<EventThread>>,
    publishers: Mutex<HashMap<String, Publisher>>,
}

impl MqttClient {
    pub fn new(connector: impl BrokerConnector + 'static) -> Self {
        Self::with_timing(connector, ClientTiming::default())
    }

    pub fn with_timing(connector: impl BrokerConnector + 'static, timing: ClientTiming) -> Self {
        Self {
            connector: Box::new(connector),
            timing,
            shared: Arc::new(Shared {
                session: RwLock::new(None),
                connected: AtomicBool::new(false),
                status: Mutex::new(STATUS_DISCONNECTED.to_string()),
                subscriptions: Mutex::new(BTreeSet::new()),
                callbacks: RwLock::new(CallbackRegistry::new()),
                pending_ack: Mutex::new(None),
            }),
            events: Mutex::new(None),
            publishers: Mutex::new(HashMap::new()),
        }
    }

    pub fn timing(&self) -> ClientTiming {
        self.timing
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// 连接状态描述
    pub fn status(&self) -> String {
        self.shared.status.lock().clone()
    }

    // ------------------------------------------------------------------------
    // 生命周期
    // ------------------------------------------------------------------------

    /// 打开会话并等待 broker 确认
    ///
    /// 已连接时直接返回 `true`。失败时保持断开状态，会话资源全部释放。
    pub fn connect(&self) -> bool {
        if self.is_connected() {
            debug!("Already connected to MQTT broker {}", self.connector.describe());
            return true;
        }

        // 上一次会话因连接丢失而残留的资源
        if self.shared.session().is_some() {
            self.close_session();
        }

        match self.open_session() {
            Ok(()) => {
                let broker = self.connector.describe();
                self.shared
                    .set_status(format!("Connected to MQTT broker {}.", broker));
                info!("Connected to MQTT broker {}", broker);
                true
            },
            Err(e) => {
                error!("Error connecting to MQTT broker: {}", e);
                self.close_session();
                self.shared
                    .set_status(format!("Error connecting to MQTT broker: {}", e));
                false
            },
        }
    }

    fn open_session(&self) -> Result<(), MqttError> {
        let (events_tx, events_rx) = unbounded();
        let (ack_tx, ack_rx) = bounded(1);
        *self.shared.pending_ack.lock() = Some(ack_tx);

        let session: Arc<dyn BrokerSession> = Arc::from(self.connector.open(events_tx)?);
        *self.shared.session.write() = Some(session);

        // 会话就绪后再启动事件线程，CONNACK 处理时可以重订阅
        self.spawn_event_thread(events_rx);

        match ack_rx.recv_timeout(self.timing.connect_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(MqttError::Connect {
                address: self.connector.describe(),
                reason,
            }),
            Err(_) => Err(MqttError::ConnectTimeout(self.timing.connect_timeout)),
        }
    }

    fn spawn_event_thread(&self, events: Receiver<BrokerEvent>) {
        let running = Arc::new(AtomicBool::new(true));
        let shared = self.shared.clone();
        let running_clone = running.clone();
        let poll = self.timing.event_poll;
        let broker = self.connector.describe();

        let handle = spawn(move || event_loop(events, shared, running_clone, poll, broker));
        *self.events.lock() = Some(EventThread { running, handle });
    }

    /// 关闭会话并回收事件线程，不触碰订阅和发布线程
    fn close_session(&self) {
        self.shared.pending_ack.lock().take();
        self.shared.connected.store(false, Ordering::Release);

        let session = self.shared.session.write().take();
        if let Some(session) = session
            && let Err(e) = session.disconnect()
        {
            debug!("MQTT session close reported: {}", e);
        }

        let events = self.events.lock().take();
        if let Some(events) = events {
            events.running.store(false, Ordering::Release);
            if let Err(e) = events.handle.join_timeout(self.timing.join_timeout) {
                error!("MQTT event thread was not reclaimed: {}", e);
            }
        }
        self.shared.connected.store(false, Ordering::Release);
    }

    /// 停止所有发布线程、取消所有订阅并关闭会话；未连接时为空操作
    pub fn disconnect(&self) {
        self.stop_all_publishing();

        let topics: Vec<String> = self.shared.subscriptions.lock().iter().cloned().collect();
        for topic in &topics {
            self.unsubscribe(topic);
        }

        let had_session = self.shared.session().is_some();
        self.close_session();
        self.shared.set_status(STATUS_DISCONNECTED);
        if had_session {
            info!("MQTT broker disconnected");
        } else {
            debug!("MQTT broker is not connected");
        }
    }

    // ------------------------------------------------------------------------
    // 发布
    // ------------------------------------------------------------------------

    /// 单次发布；结构化载荷序列化为 JSON 文本
    pub fn publish_once(&self, topic: &str, payload: impl Into<Payload>) -> bool {
        if !self.is_connected() {
            warn!("MQTT not connected, dropping message for '{}'", topic);
            return false;
        }
        let Some(session) = self.shared.session() else {
            return false;
        };

        match payload
            .into()
            .to_bytes()
            .and_then(|bytes| session.publish(topic, bytes))
        {
            Ok(()) => {
                trace!("Published to '{}'", topic);
                true
            },
            Err(e) => {
                error!("Failed to publish to '{}': {}", topic, e);
                false
            },
        }
    }

    /// 为 `topic` 启动周期发布线程
    ///
    /// 未连接或该主题已在发布时返回 `false`。
    pub fn start_publishing(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        interval: Duration,
    ) -> bool {
        if !self.is_connected() {
            warn!("MQTT not connected, cannot publish '{}'", topic);
            return false;
        }

        let mut publishers = self.publishers.lock();
        if publishers.contains_key(topic) {
            warn!("Topic '{}' is already publishing", topic);
            return false;
        }

        let slot = Arc::new(Mutex::new(PublishSlot {
            payload: payload.into(),
            interval,
        }));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = self.shared.clone();
        let slot_clone = slot.clone();
        let topic_owned = topic.to_string();

        let handle = spawn(move || publish_loop(topic_owned, slot_clone, stop_rx, shared));

        publishers.insert(
            topic.to_string(),
            Publisher {
                stop_tx,
                slot,
                handle,
            },
        );
        info!("Started publishing '{}' every {:?}", topic, interval);
        true
    }

    /// 替换发布中的载荷，下一次发布生效；主题未在发布时返回 `false`
    pub fn update_publish_data(&self, topic: &str, payload: impl Into<Payload>) -> bool {
        let slot = self
            .publishers
            .lock()
            .get(topic)
            .map(|publisher| publisher.slot.clone());
        match slot {
            Some(slot) => {
                slot.lock().payload = payload.into();
                true
            },
            None => false,
        }
    }

    pub fn is_publishing(&self, topic: &str) -> bool {
        self.publishers.lock().contains_key(topic)
    }

    pub fn publishing_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.publishers.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// 停止并回收 `topic` 的发布线程；未在发布时返回 `false`
    pub fn stop_publishing(&self, topic: &str) -> bool {
        let publisher = self.publishers.lock().remove(topic);
        let Some(publisher) = publisher else {
            debug!("Topic '{}' is not publishing", topic);
            return false;
        };
        self.join_publisher(topic, publisher);
        info!("Stopped publishing '{}'", topic);
        true
    }

    fn stop_all_publishing(&self) {
        let publishers: Vec<(String, Publisher)> = self.publishers.lock().drain().collect();
        for (topic, publisher) in publishers {
            self.join_publisher(&topic, publisher);
            info!("Stopped publishing '{}'", topic);
        }
    }

    fn join_publisher(&self, topic: &str, publisher: Publisher) {
        let _ = publisher.stop_tx.try_send(());
        if let Err(e) = publisher.handle.join_timeout(self.timing.join_timeout) {
            error!("Publish thread for '{}' was not reclaimed: {}", topic, e);
        }
    }

    // ------------------------------------------------------------------------
    // 订阅
    // ------------------------------------------------------------------------

    /// 订阅 `topic`，并可同时设置一个回调
    ///
    /// 需要已连接。订阅的主题在重连后自动恢复。
    pub fn subscribe(&self, topic: &str, callback: Option<MessageCallback>) -> bool {
        if !self.is_connected() {
            warn!("MQTT not connected, cannot subscribe to '{}'", topic);
            return false;
        }
        let Some(session) = self.shared.session() else {
            return false;
        };

        if let Err(e) = session.subscribe(topic) {
            error!("Failed to subscribe to '{}': {}", topic, e);
            return false;
        }
        self.shared.subscriptions.lock().insert(topic.to_string());
        if let Some(callback) = callback {
            self.shared.callbacks.write().set(topic, callback);
        }
        info!("Subscribed to '{}'", topic);
        true
    }

    /// 取消订阅并移除该主题所有类型的回调；未订阅时返回 `false`
    pub fn unsubscribe(&self, topic: &str) -> bool {
        if !self.shared.subscriptions.lock().remove(topic) {
            warn!("Topic '{}' is not subscribed", topic);
            return false;
        }
        self.shared.callbacks.write().remove_topic(topic);

        if let Some(session) = self.shared.session()
            && let Err(e) = session.unsubscribe(topic)
        {
            error!("Failed to unsubscribe from '{}': {}", topic, e);
        }
        info!("Unsubscribed from '{}'", topic);
        true
    }

    /// 替换 `topic` 在回调类型下的回调，不改变订阅
    pub fn set_message_callback(&self, topic: &str, callback: MessageCallback) {
        self.shared.callbacks.write().set(topic, callback);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.lock().iter().cloned().collect()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn event_loop(
    events: Receiver<BrokerEvent>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    poll: Duration,
    broker: String,
) {
    loop {
        if !running.load(Ordering::Acquire) {
            trace!("MQTT event thread: running flag is false, exiting");
            break;
        }

        match events.recv_timeout(poll) {
            Ok(event) => shared.handle_event(event, &broker),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                trace!("MQTT event thread: session closed, exiting");
                break;
            },
        }
    }
}

fn publish_loop(
    topic: String,
    slot: Arc<Mutex<PublishSlot>>,
    stop_rx: Receiver<()>,
    shared: Arc<Shared>,
) {
    let mut failing = false;
    loop {
        let (bytes, interval) = {
            let slot = slot.lock();
            (slot.payload.to_bytes(), slot.interval)
        };

        if shared.connected.load(Ordering::Acquire)
            && let Some(session) = shared.session()
        {
            match bytes.and_then(|bytes| session.publish(&topic, bytes)) {
                Ok(()) => {
                    if failing {
                        info!("Publishing '{}' recovered", topic);
                        failing = false;
                    }
                },
                Err(e) if !failing => {
                    warn!("Publishing '{}' failed: {}", topic, e);
                    failing = true;
                },
                Err(e) => trace!("Publishing '{}' still failing: {}", topic, e),
            }
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("Publish thread for '{}' exited", topic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBroker;
    use serde_json::json;
    use std::time::Instant;

    fn fast_timing() -> ClientTiming {
        ClientTiming {
            connect_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_secs(1),
            event_poll: Duration::from_millis(10),
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_connect_disconnect_lifecycle() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(!client.is_connected());
        assert_eq!(client.status(), "MQTT broker disconnected.");

        assert!(client.connect());
        assert!(client.is_connected());
        assert_eq!(client.status(), "Connected to MQTT broker mock:1883.");

        assert!(client.connect());
        assert_eq!(broker.open_count(), 1);

        client.disconnect();
        assert!(!client.is_connected());
        assert_eq!(client.status(), "MQTT broker disconnected.");
        client.disconnect();
    }

    #[test]
    fn test_connect_failures() {
        let broker = MockBroker::new();
        broker.set_open_failure(true);
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(!client.connect());
        assert!(client.status().starts_with("Error connecting to MQTT broker"));

        broker.set_open_failure(false);
        broker.set_refuse_connection(true);
        assert!(!client.connect());
        assert!(!client.is_connected());
        assert!(client.status().contains("refused"));

        broker.set_refuse_connection(false);
        assert!(client.connect());
    }

    #[test]
    fn test_operations_require_connection() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(!client.publish_once("t", "x"));
        assert!(!client.subscribe("t", None));
        assert!(!client.start_publishing("t", "x", Duration::from_millis(10)));
        assert!(!client.unsubscribe("t"));
        assert!(broker.published().is_empty());
    }

    #[test]
    fn test_publish_once_serializes_structured_payload() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(client.connect());

        assert!(client.publish_once("a", json!({"Gear": 6})));
        assert!(client.publish_once("b", "plain"));
        assert_eq!(broker.published_on("a"), vec![br#"{"Gear":6}"#.to_vec()]);
        assert_eq!(broker.published_on("b"), vec![b"plain".to_vec()]);

        broker.set_publish_failure(true);
        assert!(!client.publish_once("a", "x"));
    }

    #[test]
    fn test_start_publishing_twice_and_stop() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(client.connect());

        assert!(!client.update_publish_data("s", "ignored"));
        assert!(client.start_publishing("s", "one", Duration::from_millis(5)));
        assert!(!client.start_publishing("s", "two", Duration::from_millis(5)));
        assert!(client.is_publishing("s"));
        assert!(broker.wait_for_publishes("s", 3, Duration::from_secs(1)));
        assert!(broker.published_on("s").iter().all(|p| p == b"one"));

        assert!(client.stop_publishing("s"));
        assert!(!client.is_publishing("s"));
        assert!(!client.stop_publishing("s"));

        let count = broker.published_on("s").len();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(broker.published_on("s").len(), count);
    }

    #[test]
    fn test_update_takes_effect_on_next_tick_exactly_once() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(client.connect());

        assert!(client.start_publishing("s", "old", Duration::from_millis(150)));
        assert!(broker.wait_for_publishes("s", 1, Duration::from_secs(1)));
        assert!(client.update_publish_data("s", "new"));

        assert!(broker.wait_for_publishes("s", 2, Duration::from_secs(1)));
        // 下一次发布前不会重复发布
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(
            broker.published_on("s"),
            vec![b"old".to_vec(), b"new".to_vec()]
        );
        client.disconnect();
    }

    #[test]
    fn test_dispatch_by_payload_kind() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(client.connect());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        assert!(client.subscribe(
            "c",
            Some(MessageCallback::json(move |_, v| s.lock().push(format!("json {}", v)))),
        ));
        let s = seen.clone();
        client.set_message_callback(
            "c",
            MessageCallback::text(move |_, t| s.lock().push(format!("text {}", t))),
        );
        let s = seen.clone();
        client.set_message_callback(
            "c",
            MessageCallback::binary(move |_, b| s.lock().push(format!("binary {}", b.len()))),
        );

        assert!(broker.inject("c", br#"{"Speed":1.0}"#.to_vec()));
        assert!(broker.inject("c", b"hello".to_vec()));
        assert!(broker.inject("c", vec![0xFF, 0x00]));
        // 未订阅主题的消息不被分发
        broker.inject("other", b"ignored".to_vec());

        assert!(wait_until(Duration::from_secs(1), || seen.lock().len() == 3));
        assert_eq!(
            *seen.lock(),
            vec![
                "json {\"Speed\":1.0}".to_string(),
                "text hello".to_string(),
                "binary 2".to_string()
            ]
        );
    }

    #[test]
    fn test_unsubscribe_removes_all_callbacks() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(client.connect());

        let hits = Arc::new(Mutex::new(0usize));
        let h = hits.clone();
        assert!(client.subscribe("c", Some(MessageCallback::text(move |_, _| *h.lock() += 1))));
        let h = hits.clone();
        client.set_message_callback("c", MessageCallback::json(move |_, _| *h.lock() += 1));
        assert_eq!(client.subscriptions(), vec!["c".to_string()]);
        assert_eq!(broker.subscriptions(), vec!["c".to_string()]);

        assert!(client.unsubscribe("c"));
        assert!(!client.unsubscribe("c"));
        assert!(broker.subscriptions().is_empty());

        // 重新订阅但不设置回调：旧回调已全部移除
        assert!(client.subscribe("c", None));
        broker.inject("c", b"text".to_vec());
        broker.inject("c", b"{}".to_vec());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_resubscribe_after_reconnect() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(client.connect());
        assert!(client.subscribe("a", None));
        assert!(client.subscribe("b", None));
        assert_eq!(broker.subscribe_count("a"), 1);

        broker.drop_connection("network unreachable");
        assert!(wait_until(Duration::from_secs(1), || !client.is_connected()));
        assert!(client.status().starts_with("MQTT connection lost"));
        assert!(!client.publish_once("a", "x"));

        broker.restore_connection();
        assert!(wait_until(Duration::from_secs(1), || client.is_connected()));
        assert!(wait_until(Duration::from_secs(1), || {
            broker.subscribe_count("a") == 2 && broker.subscribe_count("b") == 2
        }));
        assert!(client.status().starts_with("Connected to MQTT broker"));
    }

    #[test]
    fn test_disconnect_stops_publishers_and_subscriptions() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(client.connect());
        assert!(client.subscribe("c", Some(MessageCallback::text(|_, _| {}))));
        assert!(client.start_publishing("s", "x", Duration::from_millis(5)));
        assert!(client.start_publishing("t", "y", Duration::from_millis(5)));
        assert_eq!(client.publishing_topics(), vec!["s".to_string(), "t".to_string()]);

        client.disconnect();
        assert!(client.publishing_topics().is_empty());
        assert!(client.subscriptions().is_empty());
        assert!(broker.subscriptions().is_empty());
    }

    #[test]
    fn test_panicking_callback_does_not_stop_dispatch() {
        let broker = MockBroker::new();
        let client = MqttClient::with_timing(broker.clone(), fast_timing());
        assert!(client.connect());

        let hits = Arc::new(Mutex::new(0usize));
        let h = hits.clone();
        assert!(client.subscribe(
            "c",
            Some(MessageCallback::text(move |_, t| {
                if t == "boom" {
                    panic!("callback failure");
                }
                *h.lock() += 1;
            })),
        ));
        broker.inject("c", b"boom".to_vec());
        broker.inject("c", b"ok".to_vec());
        assert!(wait_until(Duration::from_secs(1), || *hits.lock() == 1));
        assert!(client.is_connected());
    }
}
