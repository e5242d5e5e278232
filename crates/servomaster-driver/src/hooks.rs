//! 钩子系统（Hook System）
//!
//! 宿主注入的观测回调：传输成功/失败、位置请求与提交、断开与重连、静默状态变化。
//!
//! # 调用约束
//!
//! 控制器在锁内只收集 [`HookEvent`]，解锁后再依次分发，所以回调可以重新调用
//! 控制器和舵机的方法。回调在提交线程上同步执行，耗时的工作应转交其他线程
//! （推荐 `crossbeam_channel::Sender::try_send`）。
//!
//! # 使用示例
//!
//! ```rust
//! use servomaster_driver::hooks::{ControllerCallback, HookManager};
//! use servomaster_driver::recording::TransferRecorder;
//! use std::sync::Arc;
//!
//! let mut hooks = HookManager::new();
//! let (recorder, rx) = TransferRecorder::new();
//! hooks.add_callback(Arc::new(recorder));
//!
//! hooks.trigger_transfer(&[0xE8, 0x53, 0xDC, 0xD0, 0x67, 0xD6]);
//! assert_eq!(rx.try_recv().unwrap().data.len(), 6);
//! ```

use servomaster_usb::UsbDeviceError;
use std::sync::Arc;

/// 控制器回调 Trait
///
/// 除 `on_transfer` 外都有空的默认实现。
pub trait ControllerCallback: Send + Sync {
    /// 输出传输成功后调用，`buffer` 是实际发送的命令缓冲区
    fn on_transfer(&self, buffer: &[u8]);

    /// 输出传输失败后调用
    fn on_transfer_failed(&self, error: &UsbDeviceError) {
        let _ = error;
    }

    /// 硬件舵机收到位置请求（通过校验后）
    fn on_position_requested(&self, channel: usize, position: f64) {
        let _ = (channel, position);
    }

    /// 硬件舵机的实际位置已提交到设备
    fn on_actual_position(&self, channel: usize, position: f64) {
        let _ = (channel, position);
    }

    /// 传输错误表明设备已断开
    fn on_disconnect(&self) {}

    /// 断开后重新发现了设备
    fn on_reconnect(&self, serial: Option<&str>) {
        let _ = serial;
    }

    /// 控制器进入（`true`）或退出（`false`）静默状态
    fn on_silent_status_changed(&self, silent: bool) {
        let _ = silent;
    }
}

/// 待分发的钩子事件
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    Transfer(Vec<u8>),
    TransferFailed(UsbDeviceError),
    ActualPosition { channel: usize, position: f64 },
    Disconnect,
    Reconnect(Option<String>),
    SilentStatusChanged(bool),
}

/// 钩子管理器
///
/// 回调列表本身不是线程安全的，需要外部同步（控制器使用 `RwLock<HookManager>`）。
#[derive(Default, Clone)]
pub struct HookManager {
    callbacks: Vec<Arc<dyn ControllerCallback>>,
}

impl HookManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ControllerCallback>) {
        self.callbacks.push(callback);
    }

    /// 移除所有回调
    pub fn clear(&mut self) {
        self.callbacks.clear();
    }

    pub fn trigger_transfer(&self, buffer: &[u8]) {
        for callback in self.callbacks.iter() {
            callback.on_transfer(buffer);
        }
    }

    pub fn trigger_transfer_failed(&self, error: &UsbDeviceError) {
        for callback in self.callbacks.iter() {
            callback.on_transfer_failed(error);
        }
    }

    pub fn trigger_position_requested(&self, channel: usize, position: f64) {
        for callback in self.callbacks.iter() {
            callback.on_position_requested(channel, position);
        }
    }

    pub fn trigger_actual_position(&self, channel: usize, position: f64) {
        for callback in self.callbacks.iter() {
            callback.on_actual_position(channel, position);
        }
    }

    pub fn trigger_disconnect(&self) {
        for callback in self.callbacks.iter() {
            callback.on_disconnect();
        }
    }

    pub fn trigger_reconnect(&self, serial: Option<&str>) {
        for callback in self.callbacks.iter() {
            callback.on_reconnect(serial);
        }
    }

    pub fn trigger_silent_status_changed(&self, silent: bool) {
        for callback in self.callbacks.iter() {
            callback.on_silent_status_changed(silent);
        }
    }

    /// 按顺序分发收集到的事件
    pub fn dispatch(&self, events: impl IntoIterator<Item = HookEvent>) {
        for event in events {
            match event {
                HookEvent::Transfer(buffer) => self.trigger_transfer(&buffer),
                HookEvent::TransferFailed(error) => self.trigger_transfer_failed(&error),
                HookEvent::ActualPosition { channel, position } => {
                    self.trigger_actual_position(channel, position)
                },
                HookEvent::Disconnect => self.trigger_disconnect(),
                HookEvent::Reconnect(serial) => self.trigger_reconnect(serial.as_deref()),
                HookEvent::SilentStatusChanged(silent) => {
                    self.trigger_silent_status_changed(silent)
                },
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
