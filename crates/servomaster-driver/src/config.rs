//! 控制器配置
//!
//! 所有字段都有默认值，TOML 中省略的键使用默认值：
//!
//! ```toml
//! serial = "12345"
//! transfer_timeout_ms = 5000
//! serial_timeout_ms = 5000
//! min_pulse = 1000
//! max_pulse = 2000
//! rediscover_on_send = true
//!
//! [transition]
//! step = 0.01
//! interval_ms = 20
//!
//! [silent]
//! enabled = false
//! timeout_ms = 10000
//! heartbeat_ms = 300000
//! ```
//!
//! 配置只读，库本身从不写回文件。

use crate::error::DriverError;
use serde::{Deserialize, Serialize};
use servomaster_protocol::MAX_PULSE_VALUE;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 默认最小脉宽（微秒）
pub const DEFAULT_MIN_PULSE: u16 = 1000;

/// 默认最大脉宽（微秒）
pub const DEFAULT_MAX_PULSE: u16 = 2000;

/// 控制器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// 未显式传入 `port` 时使用的序列号
    pub serial: Option<String>,

    /// 输出控制传输超时（毫秒）
    pub transfer_timeout_ms: u64,

    /// 序列号描述符读取超时（毫秒）
    pub serial_timeout_ms: u64,

    /// 新建舵机的默认脉宽范围
    pub min_pulse: u16,
    pub max_pulse: u16,

    /// 设备断开后，`send()` 是否重新发现设备
    pub rediscover_on_send: bool,

    pub transition: TransitionConfig,

    pub silent: SilentConfig,
}

/// 爬行过渡配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransitionConfig {
    /// 每步移动量；`None` 表示按舵机精度推导
    pub step: Option<f64>,

    /// 步间隔（毫秒）
    pub interval_ms: u64,
}

/// 自动静默配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SilentConfig {
    /// 初始化后立即开启自动静默
    pub enabled: bool,

    /// 空闲多久后静默（毫秒，必须大于零）
    pub timeout_ms: u64,

    /// 静默后多久重新发送一次当前位置（毫秒）；0 表示不发送
    pub heartbeat_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            serial: None,
            transfer_timeout_ms: 5000,
            serial_timeout_ms: 5000,
            min_pulse: DEFAULT_MIN_PULSE,
            max_pulse: DEFAULT_MAX_PULSE,
            rediscover_on_send: true,
            transition: TransitionConfig::default(),
            silent: SilentConfig::default(),
        }
    }
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            step: None,
            interval_ms: 20,
        }
    }
}

impl Default for SilentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: 10_000,
            heartbeat_ms: 300_000,
        }
    }
}

impl ControllerConfig {
    /// 从 TOML 字符串解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self, DriverError> {
        let config: Self =
            toml::from_str(content).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DriverError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// 校验取值范围
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.min_pulse >= self.max_pulse || self.max_pulse > MAX_PULSE_VALUE {
            return Err(DriverError::InvalidRange {
                min: self.min_pulse,
                max: self.max_pulse,
            });
        }

        if let Some(step) = self.transition.step
            && !(step > 0.0 && step <= 1.0)
        {
            return Err(DriverError::Config(format!(
                "transition step must be in (0.0, 1.0], got {}",
                step
            )));
        }

        if self.transfer_timeout_ms == 0 || self.serial_timeout_ms == 0 {
            return Err(DriverError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        if self.silent.timeout_ms == 0 {
            return Err(DriverError::Config(
                "silent timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_timeout_ms)
    }
}

impl TransitionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SilentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.serial, None);
        assert_eq!(config.transfer_timeout(), Duration::from_secs(5));
        assert_eq!(config.serial_timeout(), Duration::from_secs(5));
        assert_eq!((config.min_pulse, config.max_pulse), (1000, 2000));
        assert!(config.rediscover_on_send);
        assert_eq!(config.transition.step, None);
        assert_eq!(config.transition.interval(), Duration::from_millis(20));
        assert!(!config.silent.enabled);
        assert_eq!(config.silent.timeout(), Duration::from_secs(10));
        assert_eq!(config.silent.heartbeat(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = ControllerConfig::from_toml_str(
            r#"
serial = "12345"
max_pulse = 2500

[transition]
step = 0.05
"#,
        )
        .unwrap();

        assert_eq!(config.serial.as_deref(), Some("12345"));
        assert_eq!(config.min_pulse, 1000);
        assert_eq!(config.max_pulse, 2500);
        assert_eq!(config.transition.step, Some(0.05));
        assert_eq!(config.transition.interval_ms, 20);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let err = ControllerConfig::from_toml_str("min_pulse = 2000\nmax_pulse = 1000").unwrap_err();
        assert!(matches!(
            err,
            DriverError::InvalidRange {
                min: 2000,
                max: 1000
            }
        ));

        let err = ControllerConfig::from_toml_str("max_pulse = 5000").unwrap_err();
        assert!(matches!(err, DriverError::InvalidRange { .. }));
    }

    #[test]
    fn test_invalid_step_rejected() {
        for step in ["0.0", "-0.1", "1.5"] {
            let err =
                ControllerConfig::from_toml_str(&format!("[transition]\nstep = {}", step)).unwrap_err();
            assert!(matches!(err, DriverError::Config(_)), "step {}", step);
        }
    }

    #[test]
    fn test_silent_section() {
        let config =
            ControllerConfig::from_toml_str("[silent]\nenabled = true\nheartbeat_ms = 0").unwrap();
        assert!(config.silent.enabled);
        assert_eq!(config.silent.timeout_ms, 10_000);
        assert!(config.silent.heartbeat().is_zero());

        let err = ControllerConfig::from_toml_str("[silent]\ntimeout_ms = 0").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = ControllerConfig::from_toml_str("baud_rate = 9600").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "serial = \"777\"\nrediscover_on_send = false").unwrap();

        let config = ControllerConfig::load(file.path()).unwrap();
        assert_eq!(config.serial.as_deref(), Some("777"));
        assert!(!config.rediscover_on_send);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ControllerConfig::load("/nonexistent/servomaster.toml").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }
}
