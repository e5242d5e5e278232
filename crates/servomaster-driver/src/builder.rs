//! Builder 模式实现
//!
//! 提供链式构造 `ServoController` 实例的便捷方式。

use crate::config::ControllerConfig;
use crate::controller::ServoController;
use crate::error::DriverError;
use crate::hooks::{ControllerCallback, HookManager};
use crate::metrics::ControllerMetrics;
use servomaster_usb::UsbBus;
use std::sync::Arc;

/// ServoController Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// use servomaster_driver::{ControllerConfig, ServoControllerBuilder};
///
/// // 使用默认配置与 libusb 总线
/// let controller = ServoControllerBuilder::new().build()?;
///
/// // 从配置文件加载，并指定序列号
/// let config = ControllerConfig::load("servomaster.toml")?;
/// let controller = ServoControllerBuilder::new()
///     .config(config)
///     .serial("31337")
///     .build()?;
/// # Ok::<(), servomaster_driver::DriverError>(())
/// ```
pub struct ServoControllerBuilder {
    /// USB 总线（默认使用 libusb）
    bus: Option<Arc<dyn UsbBus>>,
    config: ControllerConfig,
    hooks: HookManager,
    /// 外部注入的指标（可与其他组件共享）
    metrics: Option<Arc<ControllerMetrics>>,
}

impl ServoControllerBuilder {
    pub fn new() -> Self {
        Self {
            bus: None,
            config: ControllerConfig::default(),
            hooks: HookManager::new(),
            metrics: None,
        }
    }

    /// 指定 USB 总线
    pub fn bus(self, bus: impl UsbBus + 'static) -> Self {
        self.shared_bus(Arc::new(bus))
    }

    /// 指定共享的 USB 总线
    pub fn shared_bus(mut self, bus: Arc<dyn UsbBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// 设置控制器配置（会覆盖之前的 `serial()`）
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置默认序列号（`init(None)` 时使用）
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.config.serial = Some(serial.into());
        self
    }

    /// 注册回调
    pub fn callback(mut self, callback: Arc<dyn ControllerCallback>) -> Self {
        self.hooks.add_callback(callback);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 构建控制器（尚未初始化，需要调用 `init()`）
    ///
    /// # 错误
    /// - `DriverError::InvalidRange` / `DriverError::Config`: 配置无效
    /// - `DriverError::Config`: 未指定总线且没有启用 `rusb` feature
    pub fn build(self) -> Result<ServoController, DriverError> {
        self.config.validate()?;

        let bus = match self.bus {
            Some(bus) => bus,
            None => Self::default_bus()?,
        };
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(ControllerMetrics::new()));

        Ok(ServoController::from_parts(
            bus,
            self.config,
            self.hooks,
            metrics,
        ))
    }

    #[cfg(feature = "rusb")]
    fn default_bus() -> Result<Arc<dyn UsbBus>, DriverError> {
        Ok(Arc::new(servomaster_usb::RusbBus))
    }

    #[cfg(not(feature = "rusb"))]
    fn default_bus() -> Result<Arc<dyn UsbBus>, DriverError> {
        Err(DriverError::Config(
            "no USB bus given and the rusb backend is disabled".to_string(),
        ))
    }
}

impl Default for ServoControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
