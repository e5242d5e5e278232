//! 驱动层错误类型定义

use servomaster_protocol::ProtocolError;
use servomaster_usb::{DiscoveryError, UsbDeviceError};
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 设备发现错误（歧义、未找到、总线枚举失败）
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// 协议错误（通道数不符、未实现、不支持的设备）
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// `init()` 只能调用一次
    #[error("Controller already initialized")]
    AlreadyInitialized,

    #[error("Controller not initialized")]
    NotInitialized,

    #[error("Invalid channel {channel}: controller has {channel_count} channels")]
    InvalidChannel { channel: usize, channel_count: usize },

    #[error("Position out of 0.0..=1.0 range: {0}")]
    PositionOutOfRange(f64),

    /// 同一条委托链上只能挂一个过渡控制器
    #[error("Can't attach more than one transition controller in a stack")]
    TransitionStackConflict,

    #[error("Transition cancelled")]
    TransitionCancelled,

    /// 控制传输失败（控制器仍可继续使用）
    #[error("Transmission error: {0}")]
    Transmission(UsbDeviceError),

    #[error("Servo on channel {channel} is disabled")]
    ServoDisabled { channel: usize },

    /// 脉宽范围必须满足 `min < max <= 4095`
    #[error("Invalid pulse range: min {min}, max {max}")]
    InvalidRange { min: u16, max: u16 },

    /// 线性变换角度必须满足 `0 <= start < end <= 180`
    #[error("Invalid transform angles: start {start}, end {end}")]
    InvalidAngles { start: f64, end: f64 },

    /// 缩放变换的系数不能为零
    #[error("Invalid scale transform: scale {scale}, shift {shift}")]
    InvalidScale { scale: f64, shift: f64 },

    /// 重新发现的设备与初始化时的型号不同
    #[error("Device changed: expected {expected}, found {found}")]
    DeviceChanged {
        expected: &'static str,
        found: &'static str,
    },

    /// 舵机所属的控制器已被销毁
    #[error("Servo controller is gone")]
    ControllerGone,

    #[error("Transition thread error: {0}")]
    Thread(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// 是否为传输错误
    pub fn is_transmission(&self) -> bool {
        matches!(self, DriverError::Transmission(_))
    }

    /// 是否为设备发现错误
    pub fn is_discovery(&self) -> bool {
        matches!(self, DriverError::Discovery(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servomaster_usb::UsbDeviceErrorKind;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::InvalidChannel {
            channel: 7,
            channel_count: 4,
        };
        assert_eq!(err.to_string(), "Invalid channel 7: controller has 4 channels");

        let err = DriverError::PositionOutOfRange(1.5);
        assert!(err.to_string().contains("1.5"));

        let err = DriverError::Transmission(UsbDeviceError::new(
            UsbDeviceErrorKind::Timeout,
            "timed out",
        ));
        assert_eq!(err.to_string(), "Transmission error: Timeout: timed out");
        assert!(err.is_transmission());
        assert!(!err.is_discovery());
    }

    #[test]
    fn test_from_discovery_error() {
        let err: DriverError = DiscoveryError::AmbiguousOrMissingDevice { found: 2 }.into();
        assert!(err.is_discovery());
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err: DriverError = ProtocolError::NotImplemented("encoding".to_string()).into();
        match err {
            DriverError::Protocol(ProtocolError::NotImplemented(what)) => {
                assert_eq!(what, "encoding")
            },
            other => panic!("Expected Protocol variant, got {:?}", other),
        }
    }
}
