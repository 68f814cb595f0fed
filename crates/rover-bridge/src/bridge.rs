//! 控制桥接
//!
//! 启动顺序（任一步失败即回滚已启动的部分）：
//!
//! 1. 连接 MQTT
//! 2. 订阅控制主题（JSON 回调）
//! 3. 连接 CAN，注册反馈帧处理器
//! 4. 以 20 ms 周期发送控制帧（初始为空挡命令）
//! 5. 以 500 ms 周期发布状态
//!
//! 停止顺序：断开 MQTT → 停止周期发送 → 断开 CAN。停止可重复调用。
//!
//! 共享状态：
//!
//! - 控制命令：MQTT 回调写，周期发送线程读，`ArcSwap` 整体替换
//! - 状态快照：CAN 接收线程写，`ArcSwap` 整体替换，同时推送到状态主题的发布槽
//! - 编码器：周期发送与即时发送共用一个实例，且都在 CAN TX 锁内编码，
//!   总线上的计数器严格逐帧递增

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rover_can::{CanTransport, FrameSource, HandlerError};
use rover_mqtt::{MessageCallback, MqttClient, Payload};
use rover_protocol::{CtrlCmdEncoder, RoverFrame};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::command::ControlCommand;
use crate::config::BridgeConfig;
use crate::status::RobotStatus;
use crate::telemetry::{FrameOutcome, TelemetryDecoders};
use crate::topics::{control_topic, status_topic};
use crate::BridgeError;

/// 一条控制消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// 已替换当前命令
    Applied,
    /// 机器人 ID 不匹配，消息被忽略
    RobotIdMismatch { expected: String, received: String },
    /// 载荷无法解析，当前命令不变
    Malformed(String),
}

/// MQTT 控制通路：解析命令、替换共享命令、即时发送一帧
#[derive(Clone)]
struct ControlPath {
    robot_id: String,
    command: Arc<ArcSwap<ControlCommand>>,
    encoder: Arc<Mutex<CtrlCmdEncoder>>,
    can: Weak<CanTransport>,
}

impl ControlPath {
    fn handle(&self, payload: &Value) -> ControlOutcome {
        info!("Received control command: {}", payload);

        let command = match ControlCommand::from_json(payload) {
            Ok(command) => command,
            Err(e) => {
                error!("Malformed control command: {}", e);
                return ControlOutcome::Malformed(e.to_string());
            },
        };

        if command.robot_id != self.robot_id {
            warn!(
                "Robot id mismatch: this robot is {}, command is for {}. Ignoring.",
                self.robot_id, command.robot_id
            );
            return ControlOutcome::RobotIdMismatch {
                expected: self.robot_id.clone(),
                received: command.robot_id,
            };
        }

        let ctrl = command.to_ctrl_cmd();
        self.command.store(Arc::new(command));

        // 周期发送之外立即发送一帧，不打断周期节奏。
        // 编码在 TX 锁内进行，计数器顺序与上总线顺序一致
        if let Some(can) = self.can.upgrade() {
            if !can.send_with(|| self.encoder.lock().encode(&ctrl)) {
                warn!("Immediate control frame was not sent");
            }
        }
        ControlOutcome::Applied
    }
}

/// CAN 反馈通路：解码、合并状态、推送到状态主题
#[derive(Clone)]
struct TelemetryPath {
    status_topic: String,
    decoders: Arc<Mutex<TelemetryDecoders>>,
    status: Arc<ArcSwap<RobotStatus>>,
    mqtt: Weak<MqttClient>,
}

impl TelemetryPath {
    fn handle(&self, frame: &RoverFrame) -> FrameOutcome {
        // 解码器锁同时串行化状态的读-改-写
        let mut decoders = self.decoders.lock();
        let mut next = RobotStatus::clone(&self.status.load());
        let outcome = decoders.apply(frame, &mut next);
        if !outcome.is_applied() {
            return outcome;
        }

        let snapshot = Arc::new(next);
        self.status.store(snapshot.clone());
        drop(decoders);

        if let Some(mqtt) = self.mqtt.upgrade() {
            match snapshot.to_json() {
                Ok(value) => {
                    mqtt.update_publish_data(&self.status_topic, Payload::Json(value));
                },
                Err(e) => error!("Failed to serialize robot status: {}", e),
            }
        }
        outcome
    }
}

/// 停止请求句柄，可跨线程克隆
///
/// 只设置标志，实际的停止流程由 `ControlBridge::run` 所在线程执行。
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// 单机器人 MQTT ↔ CAN 桥接
pub struct ControlBridge {
    config: BridgeConfig,
    control_topic: String,
    status_topic: String,
    can: Arc<CanTransport>,
    mqtt: Arc<MqttClient>,
    command: Arc<ArcSwap<ControlCommand>>,
    status: Arc<ArcSwap<RobotStatus>>,
    encoder: Arc<Mutex<CtrlCmdEncoder>>,
    decoders: Arc<Mutex<TelemetryDecoders>>,
    running: AtomicBool,
    shutdown: Arc<AtomicBool>,
    /// 串行化 start / stop
    lifecycle: Mutex<()>,
}

impl ControlBridge {
    /// 使用配置中的 SocketCAN 与 MQTT broker
    pub fn new(config: BridgeConfig) -> Self {
        let can = CanTransport::with_timing(config.can.clone(), config.timing.transport_timing());
        let mqtt_config = config.mqtt_config();
        let client_timing = config.timing.client_timing(mqtt_config.connect_timeout());
        let mqtt = MqttClient::with_timing(mqtt_config, client_timing);
        Self::with_transports(config, can, mqtt)
    }

    /// 使用外部构造的传输层（例如 mock 后端）
    pub fn with_transports(config: BridgeConfig, can: CanTransport, mqtt: MqttClient) -> Self {
        let robot_id = config.robot_id.clone();
        Self {
            control_topic: control_topic(&robot_id),
            status_topic: status_topic(&robot_id),
            can: Arc::new(can),
            mqtt: Arc::new(mqtt),
            command: Arc::new(ArcSwap::from_pointee(ControlCommand::neutral(robot_id.clone()))),
            status: Arc::new(ArcSwap::from_pointee(RobotStatus::new(robot_id))),
            encoder: Arc::new(Mutex::new(CtrlCmdEncoder::new())),
            decoders: Arc::new(Mutex::new(TelemetryDecoders::new(config.frame_policy))),
            running: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn robot_id(&self) -> &str {
        &self.config.robot_id
    }

    pub fn control_topic(&self) -> &str {
        &self.control_topic
    }

    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 当前控制命令快照
    pub fn command(&self) -> ControlCommand {
        ControlCommand::clone(&self.command.load())
    }

    /// 当前状态快照
    pub fn status(&self) -> RobotStatus {
        RobotStatus::clone(&self.status.load())
    }

    pub fn can(&self) -> &CanTransport {
        &self.can
    }

    pub fn mqtt(&self) -> &MqttClient {
        &self.mqtt
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            requested: self.shutdown.clone(),
        }
    }

    fn control_path(&self) -> ControlPath {
        ControlPath {
            robot_id: self.config.robot_id.clone(),
            command: self.command.clone(),
            encoder: self.encoder.clone(),
            can: Arc::downgrade(&self.can),
        }
    }

    fn telemetry_path(&self) -> TelemetryPath {
        TelemetryPath {
            status_topic: self.status_topic.clone(),
            decoders: self.decoders.clone(),
            status: self.status.clone(),
            mqtt: Arc::downgrade(&self.mqtt),
        }
    }

    // ------------------------------------------------------------------------
    // 数据通路
    // ------------------------------------------------------------------------

    /// 处理一条控制消息（MQTT 回调调用同一路径）
    pub fn on_control_message(&self, payload: &Value) -> ControlOutcome {
        self.control_path().handle(payload)
    }

    /// 处理一帧 CAN 反馈（接收线程调用同一路径）
    pub fn on_can_frame(&self, frame: &RoverFrame) -> FrameOutcome {
        self.telemetry_path().handle(frame)
    }

    // ------------------------------------------------------------------------
    // 生命周期
    // ------------------------------------------------------------------------

    /// 启动桥接；失败时回滚并返回失败的步骤
    pub fn start(&self) -> Result<(), BridgeError> {
        let _guard = self.lifecycle.lock();
        if self.is_running() {
            debug!("Edge bridge for robot {} is already running", self.robot_id());
            return Ok(());
        }

        info!("Starting edge bridge for robot {}", self.robot_id());
        match self.start_sequence() {
            Ok(()) => {
                self.running.store(true, Ordering::Release);
                info!("Edge bridge for robot {} started", self.robot_id());
                Ok(())
            },
            Err(e) => {
                error!("Edge bridge startup failed: {}", e);
                self.teardown();
                Err(e)
            },
        }
    }

    fn start_sequence(&self) -> Result<(), BridgeError> {
        info!("Connecting to MQTT broker...");
        if !self.mqtt.connect() {
            return Err(BridgeError::MqttConnect(self.mqtt.status()));
        }

        info!("Subscribing to control topic {}", self.control_topic);
        let control = self.control_path();
        let callback = MessageCallback::json(move |_topic, payload| {
            control.handle(payload);
        });
        if !self.mqtt.subscribe(&self.control_topic, Some(callback)) {
            return Err(BridgeError::Subscribe(self.control_topic.clone()));
        }

        info!("Connecting to CAN bus...");
        if !self.can.connect() {
            return Err(BridgeError::CanConnect(self.can.status()));
        }

        self.can.clear_handlers();
        self.decoders.lock().reset();
        let telemetry = self.telemetry_path();
        self.can
            .register_handler(move |frame: &RoverFrame| -> Result<(), HandlerError> {
                match telemetry.handle(frame) {
                    FrameOutcome::Malformed(e) => Err(e.into()),
                    _ => Ok(()),
                }
            });

        // 每个周期以当前命令重新编码；生成器在 TX 锁内被调用
        self.command
            .store(Arc::new(ControlCommand::neutral(self.robot_id())));
        let command = self.command.clone();
        let encoder = self.encoder.clone();
        let source = FrameSource::Generator(Box::new(move || {
            let ctrl = command.load().to_ctrl_cmd();
            Some(encoder.lock().encode(&ctrl))
        }));
        if !self
            .can
            .start_periodic_with(source, self.config.timing.can_send_interval())
        {
            return Err(BridgeError::PeriodicSend);
        }

        info!("Publishing status to {}", self.status_topic);
        let initial = self
            .status
            .load()
            .to_json()
            .map_err(|_| BridgeError::StatusPublish(self.status_topic.clone()))?;
        if !self.mqtt.start_publishing(
            &self.status_topic,
            Payload::Json(initial),
            self.config.timing.status_publish_interval(),
        ) {
            return Err(BridgeError::StatusPublish(self.status_topic.clone()));
        }
        Ok(())
    }

    /// 停止桥接；未运行时为空操作
    pub fn stop(&self) {
        let _guard = self.lifecycle.lock();
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Stopping edge bridge for robot {}", self.robot_id());
        } else {
            debug!("Edge bridge for robot {} is not running", self.robot_id());
        }
        self.teardown();
    }

    fn teardown(&self) {
        if self.mqtt.is_connected() {
            info!("Disconnecting from MQTT broker...");
        }
        self.mqtt.disconnect();

        self.can.stop_periodic_send();

        if self.can.is_connected() {
            info!("Disconnecting from CAN bus...");
        }
        self.can.disconnect();
        self.running.store(false, Ordering::Release);
    }

    /// 启动并阻塞，直到收到停止请求，然后执行停止流程
    pub fn run(&self) -> Result<(), BridgeError> {
        self.start()?;

        let poll = self.config.timing.idle_poll();
        while self.is_running() && !self.shutdown.load(Ordering::Acquire) {
            std::thread::sleep(poll);
        }

        if self.shutdown.load(Ordering::Acquire) {
            info!("Shutdown requested");
        }
        self.stop();
        info!("Edge bridge for robot {} stopped", self.robot_id());
        Ok(())
    }
}

impl Drop for ControlBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
