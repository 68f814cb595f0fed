//! 载荷与订阅回调
//!
//! 入站消息按以下顺序判定类型，只调用该主题在对应类型下注册的回调：
//!
//! 1. UTF-8 且能解析为 JSON → `Json`
//! 2. UTF-8 但不是 JSON → `Text`
//! 3. 非 UTF-8 → `Binary`

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, trace};

use crate::MqttError;

/// 出站/入站载荷
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    /// 结构化数据，发送前序列化为 JSON 文本
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// 按 JSON → 文本 → 二进制的顺序解析入站字节
    pub fn decode(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => Payload::Json(value),
                Err(_) => Payload::Text(text.to_string()),
            },
            Err(_) => Payload::Binary(bytes.to_vec()),
        }
    }

    /// 编码为线上字节
    pub fn to_bytes(&self) -> Result<Vec<u8>, MqttError> {
        match self {
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Json(value) => Ok(serde_json::to_vec(value)?),
            Payload::Binary(bytes) => Ok(bytes.clone()),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Text(_) => MessageKind::Text,
            Payload::Json(_) => MessageKind::Json,
            Payload::Binary(_) => MessageKind::Binary,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// 订阅回调的消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Json,
    Binary,
}

type TextFn = dyn Fn(&str, &str) + Send + Sync;
type JsonFn = dyn Fn(&str, &Value) + Send + Sync;
type BinaryFn = dyn Fn(&str, &[u8]) + Send + Sync;

/// 按消息类型区分的回调，参数为 `(topic, payload)`
#[derive(Clone)]
pub enum MessageCallback {
    Text(Arc<TextFn>),
    Json(Arc<JsonFn>),
    Binary(Arc<BinaryFn>),
}

impl MessageCallback {
    pub fn text(f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        MessageCallback::Text(Arc::new(f))
    }

    pub fn json(f: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        MessageCallback::Json(Arc::new(f))
    }

    pub fn binary(f: impl Fn(&str, &[u8]) + Send + Sync + 'static) -> Self {
        MessageCallback::Binary(Arc::new(f))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageCallback::Text(_) => MessageKind::Text,
            MessageCallback::Json(_) => MessageKind::Json,
            MessageCallback::Binary(_) => MessageKind::Binary,
        }
    }
}

impl std::fmt::Debug for MessageCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCallback::{:?}", self.kind())
    }
}

/// 单个主题的回调槽，每种类型最多一个
#[derive(Default, Clone)]
struct TopicCallbacks {
    text: Option<Arc<TextFn>>,
    json: Option<Arc<JsonFn>>,
    binary: Option<Arc<BinaryFn>>,
}

impl TopicCallbacks {
    fn is_empty(&self) -> bool {
        self.text.is_none() && self.json.is_none() && self.binary.is_none()
    }
}

/// 主题 → 回调注册表
#[derive(Default)]
pub struct CallbackRegistry {
    topics: HashMap<String, TopicCallbacks>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置回调，替换该主题同类型的旧回调
    pub fn set(&mut self, topic: &str, callback: MessageCallback) {
        let slot = self.topics.entry(topic.to_string()).or_default();
        match callback {
            MessageCallback::Text(f) => slot.text = Some(f),
            MessageCallback::Json(f) => slot.json = Some(f),
            MessageCallback::Binary(f) => slot.binary = Some(f),
        }
    }

    /// 移除该主题所有类型的回调
    pub fn remove_topic(&mut self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    pub fn clear(&mut self) {
        self.topics.clear();
    }

    pub fn has(&self, topic: &str, kind: MessageKind) -> bool {
        self.topics.get(topic).is_some_and(|slot| match kind {
            MessageKind::Text => slot.text.is_some(),
            MessageKind::Json => slot.json.is_some(),
            MessageKind::Binary => slot.binary.is_some(),
        })
    }

    pub fn topic_count(&self) -> usize {
        self.topics.values().filter(|slot| !slot.is_empty()).count()
    }

    /// 取出与载荷类型匹配的回调，调用方在释放锁后执行
    pub fn resolve(&self, topic: &str, payload: Payload) -> Option<Dispatch> {
        let slot = self.topics.get(topic)?;
        match payload {
            Payload::Json(value) => slot.json.clone().map(|f| Dispatch::Json(f, value)),
            Payload::Text(text) => slot.text.clone().map(|f| Dispatch::Text(f, text)),
            Payload::Binary(bytes) => slot.binary.clone().map(|f| Dispatch::Binary(f, bytes)),
        }
    }
}

/// 已解析的一次回调调用
pub enum Dispatch {
    Text(Arc<TextFn>, String),
    Json(Arc<JsonFn>, Value),
    Binary(Arc<BinaryFn>, Vec<u8>),
}

impl Dispatch {
    /// 执行回调；回调 panic 被捕获并记录，返回 `false`
    pub fn invoke(self, topic: &str) -> bool {
        let result = catch_unwind(AssertUnwindSafe(|| match &self {
            Dispatch::Text(f, text) => f(topic, text),
            Dispatch::Json(f, value) => f(topic, value),
            Dispatch::Binary(f, bytes) => f(topic, bytes),
        }));
        match result {
            Ok(()) => {
                trace!("Dispatched message on '{}'", topic);
                true
            },
            Err(_) => {
                error!("Message callback for '{}' panicked", topic);
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_decode_priority() {
        assert_eq!(
            Payload::decode(br#"{"Gear":6}"#),
            Payload::Json(json!({"Gear": 6}))
        );
        // 裸数字也是合法 JSON
        assert_eq!(Payload::decode(b"42"), Payload::Json(json!(42)));
        assert_eq!(Payload::decode(b"hello"), Payload::Text("hello".into()));
        assert_eq!(
            Payload::decode(&[0xFF, 0xFE, 0x00]),
            Payload::Binary(vec![0xFF, 0xFE, 0x00])
        );
    }

    #[test]
    fn test_to_bytes() {
        assert_eq!(Payload::from("abc").to_bytes().unwrap(), b"abc");
        assert_eq!(
            Payload::from(json!({"a": 1})).to_bytes().unwrap(),
            br#"{"a":1}"#
        );
        assert_eq!(Payload::from(vec![1u8, 2]).to_bytes().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_resolve_only_matching_kind() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::new();

        let h = hits.clone();
        registry.set(
            "t",
            MessageCallback::json(move |_, v| h.lock().push(format!("json:{}", v))),
        );
        let h = hits.clone();
        registry.set(
            "t",
            MessageCallback::text(move |_, s| h.lock().push(format!("text:{}", s))),
        );

        registry
            .resolve("t", Payload::decode(b"[1]"))
            .unwrap()
            .invoke("t");
        registry
            .resolve("t", Payload::decode(b"plain"))
            .unwrap()
            .invoke("t");
        // 没有二进制回调
        assert!(registry.resolve("t", Payload::decode(&[0xC3])).is_none());
        assert!(registry.resolve("other", Payload::decode(b"x")).is_none());

        assert_eq!(*hits.lock(), vec!["json:[1]", "text:plain"]);
    }

    #[test]
    fn test_set_replaces_and_remove_clears_all_kinds() {
        let mut registry = CallbackRegistry::new();
        registry.set("t", MessageCallback::text(|_, _| {}));
        registry.set("t", MessageCallback::binary(|_, _| {}));
        registry.set("t", MessageCallback::text(|_, _| {}));
        assert!(registry.has("t", MessageKind::Text));
        assert!(registry.has("t", MessageKind::Binary));
        assert!(!registry.has("t", MessageKind::Json));
        assert_eq!(registry.topic_count(), 1);

        assert!(registry.remove_topic("t"));
        assert!(!registry.has("t", MessageKind::Text));
        assert!(!registry.has("t", MessageKind::Binary));
        assert!(!registry.remove_topic("t"));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut registry = CallbackRegistry::new();
        registry.set("t", MessageCallback::text(|_, _| panic!("boom")));
        let dispatch = registry.resolve("t", Payload::decode(b"x")).unwrap();
        assert!(!dispatch.invoke("t"));
    }
}
