//! broker 连接参数与 rumqttc 后端

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rover_can::JoinTimeout;
use rumqttc::{
    Client, ClientError, ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet,
    QoS,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{BoxedSession, BrokerConnector, BrokerEvent, BrokerSession, MqttError};

const DEFAULT_CLIENT_ID: &str = "Robot00";
const DEFAULT_PASSWORD: &str = "password";

/// 请求队列容量
const REQUEST_CAPACITY: usize = 10;
/// 连接失败后等待多久再让事件循环重连
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// 关闭会话时等待网络线程退出的上限
const NETWORK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT broker 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// 缺省为 "Robot00"
    pub client_id: Option<String>,
    /// 缺省与 client id 相同
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// 等待 CONNACK 的上限
    pub connect_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 60,
            connect_timeout_ms: 5000,
        }
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: Some(client_id.into()),
            ..Self::default()
        }
    }

    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(DEFAULT_CLIENT_ID)
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or_else(|| self.client_id())
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or(DEFAULT_PASSWORD)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id(), self.host.as_str(), self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        options.set_credentials(self.username(), self.password());
        options
    }
}

impl BrokerConnector for MqttConfig {
    fn open(&self, events: Sender<BrokerEvent>) -> Result<BoxedSession, MqttError> {
        let (client, connection) = Client::new(self.mqtt_options(), REQUEST_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));

        let address = self.address();
        let closing_clone = closing.clone();
        let handle = thread::Builder::new()
            .name("mqtt-network".to_string())
            .spawn(move || network_loop(connection, events, closing_clone, address))
            .map_err(|e| MqttError::Connect {
                address: self.address(),
                reason: format!("failed to spawn network thread: {}", e),
            })?;

        debug!("MQTT session to {} opened as '{}'", self.address(), self.client_id());
        Ok(Box::new(RumqttcSession {
            client,
            closing,
            network: Mutex::new(Some(handle)),
        }))
    }

    fn describe(&self) -> String {
        self.address()
    }
}

fn client_error(e: ClientError) -> MqttError {
    MqttError::Client(e.to_string())
}

/// rumqttc 同步客户端会话
struct RumqttcSession {
    client: Client,
    closing: Arc<AtomicBool>,
    network: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerSession for RumqttcSession {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(client_error)
    }

    fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(client_error)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client.unsubscribe(topic).map_err(client_error)
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        self.closing.store(true, Ordering::Release);
        // 事件循环已退出时请求队列已关闭，此时失败无关紧要
        let result = self.client.disconnect().map_err(client_error);

        if let Some(handle) = self.network.lock().take()
            && handle.join_timeout(NETWORK_JOIN_TIMEOUT).is_err()
        {
            warn!(
                "MQTT network thread did not exit within {:?}",
                NETWORK_JOIN_TIMEOUT
            );
        }
        result
    }
}

/// 驱动 rumqttc 事件循环，把通知翻译为 `BrokerEvent`
///
/// 连接错误后事件循环在下一次轮询时自动重连。
fn network_loop(
    mut connection: Connection,
    events: Sender<BrokerEvent>,
    closing: Arc<AtomicBool>,
    address: String,
) {
    let mut online = false;

    for notification in connection.iter() {
        let event = match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    online = true;
                    info!("MQTT broker {} acknowledged connection", address);
                    BrokerEvent::Connected
                } else {
                    BrokerEvent::Disconnected(format!("connection refused: {:?}", ack.code))
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(BrokerEvent::Disconnected("client disconnect".to_string()));
                break;
            },
            Ok(other) => {
                trace!("MQTT event: {:?}", other);
                continue;
            },
            Err(e) => {
                if closing.load(Ordering::Acquire) {
                    break;
                }
                if online {
                    warn!("MQTT connection to {} lost: {}", address, e);
                    online = false;
                } else {
                    debug!("MQTT connection to {} failed: {}", address, e);
                }
                if events.send(BrokerEvent::Disconnected(e.to_string())).is_err() {
                    break;
                }
                if wait_or_closing(&closing, RECONNECT_DELAY) {
                    break;
                }
                continue;
            },
        };

        if events.send(event).is_err() {
            break;
        }
    }
    trace!("MQTT network thread exited");
}

/// 等待 `delay`，期间关闭则返回 `true`
fn wait_or_closing(closing: &AtomicBool, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if closing.load(Ordering::Acquire) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    closing.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_credentials_follow_client_id() {
        let config = MqttConfig::default();
        assert_eq!(config.client_id(), "Robot00");
        assert_eq!(config.username(), "Robot00");
        assert_eq!(config.password(), "password");

        let config = MqttConfig::new("broker.local", 1884, "Robot_01");
        assert_eq!(config.username(), "Robot_01");
        assert_eq!(config.address(), "broker.local:1884");
        assert_eq!(config.describe(), "broker.local:1884");
    }

    #[test]
    fn test_explicit_credentials() {
        let config = MqttConfig {
            username: Some("operator".to_string()),
            password: Some("secret".to_string()),
            ..MqttConfig::new("localhost", 1883, "Robot_02")
        };
        assert_eq!(config.username(), "operator");
        assert_eq!(config.password(), "secret");
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: MqttConfig = serde_json::from_str(r#"{"host":"10.0.0.5"}"#).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive_secs, 60);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }
}
