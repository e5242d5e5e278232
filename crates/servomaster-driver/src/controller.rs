//! 舵机控制器
//!
//! 控制器持有设备上下文、协议处理器、所有通道的脉宽数组以及懒创建的硬件舵机，
//! 是唯一的命令缓冲区写入者和唯一的控制传输发起者。
//!
//! # 状态机
//!
//! ```text
//! Uninitialized --init()--> Initializing --> Ready <--> Disconnected
//!       |                         |                          |
//!       +<-------- 失败 ----------+            close() --> Closed
//! ```
//!
//! # 加锁
//!
//! 状态、设备上下文、协议处理器、脉宽数组在同一把锁内：
//! 一次提交 = 加锁 -> 写入通道 -> 编码 -> 传输 -> 解锁，两个通道的修改不会在缓冲区中交错。
//! 锁内产生的钩子事件先收集起来，解锁后再分发。
//!
//! # 自动静默
//!
//! `set_silent_mode(true)` 启动后台线程 `servomaster-silencer`，空闲超时后发送静默缓冲区，
//! 下一次提交或 `reset()` 唤醒控制器。

use crate::builder::ServoControllerBuilder;
use crate::config::ControllerConfig;
use crate::error::DriverError;
use crate::hooks::{ControllerCallback, HookEvent, HookManager};
use crate::metrics::ControllerMetrics;
use crate::servo::Servo;
use crate::silent::{SilentAction, Silencer};
use parking_lot::{Mutex, RwLock};
use servomaster_protocol::{DeviceDescriptor, ProtocolHandler, handler_for_id};
use servomaster_usb::{
    DeviceContext, DiscoveryError, UsbBus, UsbDeviceError, UsbDeviceErrorKind, select_device,
};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 控制器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    Uninitialized,
    Initializing,
    Ready,
    /// 设备句柄已失效，下一次发送时重新发现
    Disconnected,
    Closed,
}

impl ControllerStatus {
    /// 已初始化且未关闭
    pub fn is_active(self) -> bool {
        matches!(self, Self::Ready | Self::Disconnected)
    }
}

/// 控制器元信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerMeta {
    pub model: &'static str,
    pub manufacturer: &'static str,
    pub channel_count: usize,
    /// 序列号（设备未提供时为 `None`）
    pub serial: Option<String>,
}

struct ControllerState {
    status: ControllerStatus,
    port_name: Option<String>,
    descriptor: Option<&'static DeviceDescriptor>,
    device: Option<DeviceContext>,
    protocol: Option<Box<dyn ProtocolHandler>>,
    raw_positions: Vec<u16>,
    servos: Vec<Option<Arc<Servo>>>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            status: ControllerStatus::Uninitialized,
            port_name: None,
            descriptor: None,
            device: None,
            protocol: None,
            raw_positions: Vec::new(),
            servos: Vec::new(),
        }
    }

    fn ensure_active(&self) -> Result<(), DriverError> {
        if self.status.is_active() {
            Ok(())
        } else {
            Err(DriverError::NotInitialized)
        }
    }
}

/// 控制器与其硬件舵机共享的部分
///
/// 舵机只持有 `Weak` 引用，控制器销毁后舵机的提交返回 `ControllerGone`。
pub(crate) struct ControllerShared {
    bus: Arc<dyn UsbBus>,
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    hooks: RwLock<HookManager>,
    pub(crate) metrics: Arc<ControllerMetrics>,
    silencer: Arc<Silencer>,
}

impl ControllerShared {
    /// 在控制器锁内执行 `f`，解锁后分发收集到的钩子事件
    fn locked<T>(
        &self,
        f: impl FnOnce(&mut ControllerState, &mut Vec<HookEvent>) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut events)
        };
        self.fire(events);
        result
    }

    /// 分发钩子事件，调用方不得持有任何锁
    pub(crate) fn fire(&self, events: Vec<HookEvent>) {
        if events.is_empty() {
            return;
        }
        // 快照回调列表，回调里可以再注册回调
        let hooks = self.hooks.read().clone();
        hooks.dispatch(events);
    }

    /// 当前回调列表的快照
    pub(crate) fn hooks(&self) -> HookManager {
        self.hooks.read().clone()
    }

    /// 写入一个通道的脉宽并发送整个缓冲区
    ///
    /// 钩子事件追加到 `events`，由调用方在释放自己的锁后通过 [`fire`](Self::fire) 分发。
    pub(crate) fn commit(
        &self,
        channel: usize,
        pulse: u16,
        position: f64,
        events: &mut Vec<HookEvent>,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.ensure_active()?;

        let channel_count = state.raw_positions.len();
        let slot = state
            .raw_positions
            .get_mut(channel)
            .ok_or(DriverError::InvalidChannel {
                channel,
                channel_count,
            })?;
        *slot = pulse;

        self.touch(events);
        self.send_locked(&mut state, events)?;

        ControllerMetrics::increment(&self.metrics.positions_committed);
        events.push(HookEvent::ActualPosition { channel, position });
        Ok(())
    }

    /// 记录一次操作，处于静默状态时唤醒
    fn touch(&self, events: &mut Vec<HookEvent>) {
        if self.silencer.touch() {
            debug!("Waking controller up");
            events.push(HookEvent::SilentStatusChanged(false));
        }
    }

    /// 执行一次到期的静默动作（由静默线程调用）
    fn run_silent_action(&self, action: SilentAction) {
        let _ = self.locked(|state, events| {
            if !state.status.is_active() {
                self.silencer.touch();
                return Ok(());
            }
            if !self.silencer.confirm(action) {
                return Ok(());
            }

            let result = match action {
                SilentAction::Sleep => self.silence_locked(state, events),
                SilentAction::WakeUp => self.send_locked(state, events),
            };

            match result {
                Ok(()) => {
                    let silent = action == SilentAction::Sleep;
                    if silent {
                        debug!("Controller silenced after idle timeout");
                    } else {
                        debug!("Controller woken up by heartbeat");
                    }
                    events.push(HookEvent::SilentStatusChanged(silent));
                },
                Err(e) => {
                    warn!("Silent mode {:?} failed: {}", action, e);
                    // 重新计时，超时后再试
                    self.silencer.touch();
                },
            }
            Ok(())
        });
    }

    fn initialize_locked(
        &self,
        state: &mut ControllerState,
        port: Option<&str>,
    ) -> Result<(), DriverError> {
        let devices = self.bus.devices().map_err(DiscoveryError::Usb)?;
        let mut context = select_device(devices, port, self.config.serial_timeout())?;

        let descriptor = context.descriptor();
        let protocol = handler_for_id(descriptor.protocol_handler_id())?;

        let port_name = match port {
            Some(port) => Some(port.to_string()),
            None => match context.ensure_serial_fetched(self.config.serial_timeout()) {
                Ok(serial) if !serial.is_empty() => Some(serial.to_string()),
                Ok(_) => None,
                Err(e) => {
                    warn!("Failed to read serial number: {}", e);
                    None
                },
            },
        };

        let channel_count = protocol.channel_count();
        info!(
            "Initialized {} ({} channels), serial #{}",
            descriptor.model,
            channel_count,
            port_name.as_deref().unwrap_or("<unknown>")
        );

        state.port_name = port_name;
        state.descriptor = Some(descriptor);
        state.device = Some(context);
        state.protocol = Some(protocol);
        state.raw_positions = vec![0; channel_count];
        state.servos = vec![None; channel_count];
        Ok(())
    }

    /// 编码当前脉宽数组并发送
    fn send_locked(
        &self,
        state: &mut ControllerState,
        events: &mut Vec<HookEvent>,
    ) -> Result<(), DriverError> {
        let protocol = state.protocol.as_ref().ok_or(DriverError::NotInitialized)?;
        let buffer = protocol.encode(&state.raw_positions)?;
        self.transmit_locked(state, &buffer, events)
    }

    /// 发送静默缓冲区，脉宽数组不变
    fn silence_locked(
        &self,
        state: &mut ControllerState,
        events: &mut Vec<HookEvent>,
    ) -> Result<(), DriverError> {
        let protocol = state.protocol.as_ref().ok_or(DriverError::NotInitialized)?;
        let buffer = protocol.silence_buffer()?;
        debug!("Silencing all channels");
        self.transmit_locked(state, &buffer, events)
    }

    fn transmit_locked(
        &self,
        state: &mut ControllerState,
        buffer: &[u8],
        events: &mut Vec<HookEvent>,
    ) -> Result<(), DriverError> {
        if state.device.is_none() {
            if !self.config.rediscover_on_send {
                return Err(DriverError::Transmission(UsbDeviceError::new(
                    UsbDeviceErrorKind::NoDevice,
                    "device disconnected",
                )));
            }
            self.rediscover_locked(state, events)?;
        }

        let Some(device) = state.device.as_mut() else {
            return Err(DriverError::NotInitialized);
        };

        trace!("Sending {}", hex::encode(buffer));
        match device.send_output(buffer, self.config.transfer_timeout()) {
            Ok(()) => {
                ControllerMetrics::increment(&self.metrics.transfers_total);
                events.push(HookEvent::Transfer(buffer.to_vec()));
                Ok(())
            },
            Err(e) => {
                ControllerMetrics::increment(&self.metrics.transfer_errors);
                warn!("Transmission failed: {}", e);

                events.push(HookEvent::TransferFailed(e.clone()));

                if e.is_disconnect() {
                    warn!("Device disconnected, will re-run discovery on next send");
                    state.device = None;
                    state.status = ControllerStatus::Disconnected;
                    events.push(HookEvent::Disconnect);
                }
                Err(DriverError::Transmission(e))
            },
        }
    }

    /// 断开后按原序列号重新发现一次（不循环重试）
    fn rediscover_locked(
        &self,
        state: &mut ControllerState,
        events: &mut Vec<HookEvent>,
    ) -> Result<(), DriverError> {
        let expected = state.descriptor.ok_or(DriverError::NotInitialized)?;
        info!(
            "Re-running discovery for serial #{}",
            state.port_name.as_deref().unwrap_or("<any>")
        );

        let devices = self.bus.devices().map_err(DiscoveryError::Usb)?;
        let context = select_device(
            devices,
            state.port_name.as_deref(),
            self.config.serial_timeout(),
        )?;

        let found = context.descriptor();
        if found.protocol_handler_id() != expected.protocol_handler_id() {
            return Err(DriverError::DeviceChanged {
                expected: expected.model,
                found: found.model,
            });
        }

        info!("Reconnected {} at {}", found.model, context.location());
        state.device = Some(context);
        state.status = ControllerStatus::Ready;
        ControllerMetrics::increment(&self.metrics.rediscoveries);
        events.push(HookEvent::Reconnect(state.port_name.clone()));
        Ok(())
    }
}

/// 舵机控制器
///
/// # Example
///
/// ```no_run
/// use servomaster_driver::ServoController;
///
/// let controller = ServoController::builder().build()?;
/// controller.init(None)?;
///
/// let servo = controller.get_servo(0)?;
/// servo.set_position(0.5)?;
/// # Ok::<(), servomaster_driver::DriverError>(())
/// ```
pub struct ServoController {
    shared: Arc<ControllerShared>,
    silencer_thread: Mutex<Option<JoinHandle<()>>>,
}

/// 静默线程：持有 `Weak`，控制器销毁后自行退出
fn silencer_loop(shared: Weak<ControllerShared>, silencer: Arc<Silencer>) {
    while let Some(action) = silencer.next_action() {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.run_silent_action(action);
    }
    trace!("Silencer thread exiting");
}

impl ServoController {
    /// 使用默认配置在指定总线上创建控制器
    pub fn new(bus: impl UsbBus + 'static) -> Self {
        Self::from_parts(
            Arc::new(bus),
            ControllerConfig::default(),
            HookManager::new(),
            Arc::new(ControllerMetrics::new()),
        )
    }

    pub fn builder() -> ServoControllerBuilder {
        ServoControllerBuilder::new()
    }

    pub(crate) fn from_parts(
        bus: Arc<dyn UsbBus>,
        config: ControllerConfig,
        hooks: HookManager,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        let silencer = Arc::new(Silencer::new(&config.silent));
        Self {
            shared: Arc::new(ControllerShared {
                bus,
                config,
                state: Mutex::new(ControllerState::new()),
                hooks: RwLock::new(hooks),
                metrics,
                silencer,
            }),
            silencer_thread: Mutex::new(None),
        }
    }

    /// 发现设备并初始化
    ///
    /// `port` 为序列号；为 `None` 时使用配置中的序列号，仍为空则要求总线上
    /// 恰好有一个已识别的控制板。失败后状态回到 `Uninitialized`，可以重试。
    ///
    /// # 错误
    /// - `DriverError::AlreadyInitialized`: 非 `Uninitialized` 状态
    /// - `DriverError::Discovery`: 候选歧义或未找到
    /// - `DriverError::Protocol`: 描述表中的型号没有协议处理器
    pub fn init(&self, port: Option<&str>) -> Result<(), DriverError> {
        {
            let mut state = self.shared.state.lock();
            if state.status != ControllerStatus::Uninitialized {
                return Err(DriverError::AlreadyInitialized);
            }

            state.status = ControllerStatus::Initializing;
            let port = port.or(self.shared.config.serial.as_deref());

            if let Err(e) = self.shared.initialize_locked(&mut state, port) {
                state.status = ControllerStatus::Uninitialized;
                return Err(e);
            }
            state.status = ControllerStatus::Ready;
        }

        if self.shared.config.silent.enabled {
            self.set_silent_mode(true)?;
        }
        Ok(())
    }

    pub fn status(&self) -> ControllerStatus {
        self.shared.state.lock().status
    }

    /// 已初始化且设备句柄有效
    pub fn is_connected(&self) -> bool {
        self.status() == ControllerStatus::Ready
    }

    /// 绑定的序列号
    pub fn port_name(&self) -> Option<String> {
        self.shared.state.lock().port_name.clone()
    }

    pub fn channel_count(&self) -> Result<usize, DriverError> {
        let state = self.shared.state.lock();
        state.ensure_active()?;
        Ok(state.raw_positions.len())
    }

    pub fn meta(&self) -> Result<ControllerMeta, DriverError> {
        let state = self.shared.state.lock();
        state.ensure_active()?;
        let descriptor = state.descriptor.ok_or(DriverError::NotInitialized)?;

        Ok(ControllerMeta {
            model: descriptor.model,
            manufacturer: descriptor.manufacturer,
            channel_count: state.raw_positions.len(),
            serial: state.port_name.clone(),
        })
    }

    /// 获取通道对应的硬件舵机
    ///
    /// 第一次调用时创建并缓存，之后对同一通道返回同一个实例。
    pub fn get_servo(&self, channel: usize) -> Result<Arc<Servo>, DriverError> {
        let mut state = self.shared.state.lock();
        state.ensure_active()?;

        let channel_count = state.servos.len();
        let slot = state
            .servos
            .get_mut(channel)
            .ok_or(DriverError::InvalidChannel {
                channel,
                channel_count,
            })?;

        if let Some(servo) = slot {
            return Ok(servo.clone());
        }

        let servo = Arc::new(Servo::hardware(
            Arc::downgrade(&self.shared),
            channel,
            self.shared.config.min_pulse,
            self.shared.config.max_pulse,
        ));
        *slot = Some(servo.clone());

        ControllerMetrics::increment(&self.shared.metrics.servos_created);
        debug!("Created servo on channel {}", channel);
        Ok(servo)
    }

    /// 已创建的硬件舵机
    pub fn servos(&self) -> Vec<Arc<Servo>> {
        self.shared
            .state
            .lock()
            .servos
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// 当前脉宽数组的副本
    pub fn raw_positions(&self) -> Vec<u16> {
        self.shared.state.lock().raw_positions.clone()
    }

    /// 编码并发送当前脉宽数组
    pub fn send(&self) -> Result<(), DriverError> {
        let shared = &self.shared;
        shared.locked(|state, events| {
            state.ensure_active()?;
            shared.touch(events);
            shared.send_locked(state, events)
        })
    }

    /// 发送静默缓冲区：所有输出停止脉冲，脉宽数组不变
    pub fn silence(&self) -> Result<(), DriverError> {
        let shared = &self.shared;
        shared.locked(|state, events| {
            state.ensure_active()?;
            shared.silence_locked(state, events)?;
            if shared.silencer.mark_silent() {
                events.push(HookEvent::SilentStatusChanged(true));
            }
            Ok(())
        })
    }

    /// 重新发送当前脉宽数组（静默之后恢复输出）
    pub fn reset(&self) -> Result<(), DriverError> {
        debug!("Re-sending current positions");
        self.send()
    }

    /// 开关自动静默
    ///
    /// 开启后空闲超过超时时间即发送静默缓冲区；关闭时如果正处于静默状态，
    /// 立即重新发送当前位置。
    ///
    /// # 错误
    /// - `DriverError::NotInitialized`: 未初始化或已关闭
    /// - `DriverError::Thread`: 无法启动静默线程
    pub fn set_silent_mode(&self, enabled: bool) -> Result<(), DriverError> {
        let shared = &self.shared;
        shared.locked(|state, events| {
            state.ensure_active()?;
            if shared.silencer.set_enabled(enabled) {
                events.push(HookEvent::SilentStatusChanged(false));
                shared.send_locked(state, events)?;
            }
            Ok(())
        })?;

        debug!("Silent mode {}", if enabled { "on" } else { "off" });
        if enabled {
            self.ensure_silencer_thread()?;
        }
        Ok(())
    }

    /// 是否开启了自动静默
    pub fn silent_mode(&self) -> bool {
        self.shared.silencer.is_enabled()
    }

    /// 控制器当前是否处于静默状态
    pub fn is_silent_now(&self) -> bool {
        // 静默动作在控制器锁内完成，加锁后读到的状态与已发送的数据一致
        let _state = self.shared.state.lock();
        self.shared.silencer.is_silent()
    }

    /// 设置空闲超时与心跳间隔
    ///
    /// 心跳为零表示静默后一直等到下一次提交。
    ///
    /// # 错误
    /// - `DriverError::Config`: `timeout` 为零
    pub fn set_silent_timeout(
        &self,
        timeout: Duration,
        heartbeat: Duration,
    ) -> Result<(), DriverError> {
        if timeout.is_zero() {
            return Err(DriverError::Config(
                "silent timeout must be greater than zero".to_string(),
            ));
        }
        self.shared.silencer.set_timeout(timeout, heartbeat);
        Ok(())
    }

    /// `(timeout, heartbeat)`
    pub fn silent_timeout(&self) -> (Duration, Duration) {
        self.shared.silencer.timeout()
    }

    fn ensure_silencer_thread(&self) -> Result<(), DriverError> {
        let mut slot = self.silencer_thread.lock();
        if slot.is_some() {
            return Ok(());
        }

        let shared = Arc::downgrade(&self.shared);
        let silencer = self.shared.silencer.clone();
        let handle = thread::Builder::new()
            .name("servomaster-silencer".to_string())
            .spawn(move || silencer_loop(shared, silencer))
            .map_err(|e| DriverError::Thread(e.to_string()))?;
        *slot = Some(handle);
        Ok(())
    }

    fn stop_silencer_thread(&self) {
        self.shared.silencer.shutdown();
        let handle = self.silencer_thread.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }

    pub fn add_callback(&self, callback: Arc<dyn ControllerCallback>) {
        self.shared.hooks.write().add_callback(callback);
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.shared.metrics
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// 停止所有过渡，释放设备句柄、舵机与协议处理器
    ///
    /// 之后控制器不可再使用；仍被外部持有的舵机提交时返回 `NotInitialized`。
    pub fn close(&self) {
        self.stop_silencer_thread();

        let servos = {
            let mut state = self.shared.state.lock();
            if state.status == ControllerStatus::Closed {
                return;
            }
            std::mem::take(&mut state.servos)
        };

        // 停止过渡时不持有控制器锁
        for servo in servos.iter().flatten() {
            servo.stop_transition();
        }

        let mut state = self.shared.state.lock();
        let was_active = state.status.is_active();
        state.device = None;
        state.protocol = None;
        state.descriptor = None;
        state.raw_positions.clear();
        state.status = ControllerStatus::Closed;

        if was_active {
            info!("Servo controller closed");
        }
    }
}

impl Drop for ServoController {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ServoController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ServoController")
            .field("status", &state.status)
            .field("port_name", &state.port_name)
            .field("model", &state.descriptor.map(|d| d.model))
            .field("raw_positions", &state.raw_positions)
            .finish()
    }
}
