//! 8 通道控制板（AdvancedServo）
//!
//! 通道数已知，但命令缓冲区格式没有公开文档。在拿到可靠的格式说明之前，
//! `encode()` 和 `buffer_size()` 都显式返回 `NotImplemented`，不猜测字节布局。

use crate::ProtocolError;
use crate::handler::ProtocolHandler;

/// 通道数
pub const ADVANCED_SERVO_CHANNELS: usize = 8;

/// AdvancedServo 协议处理器
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvancedServoProtocol;

impl ProtocolHandler for AdvancedServoProtocol {
    fn model(&self) -> &'static str {
        "AdvancedServo"
    }

    fn channel_count(&self) -> usize {
        ADVANCED_SERVO_CHANNELS
    }

    fn buffer_size(&self) -> Result<usize, ProtocolError> {
        Err(ProtocolError::NotImplemented(
            "AdvancedServo command buffer size".to_string(),
        ))
    }

    fn encode(&self, raw_positions: &[u16]) -> Result<Vec<u8>, ProtocolError> {
        if raw_positions.len() != ADVANCED_SERVO_CHANNELS {
            return Err(ProtocolError::InvalidChannelCount {
                expected: ADVANCED_SERVO_CHANNELS,
                actual: raw_positions.len(),
            });
        }

        Err(ProtocolError::NotImplemented(
            "AdvancedServo command encoding".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_count() {
        assert_eq!(AdvancedServoProtocol.channel_count(), 8);
    }

    #[test]
    fn test_buffer_size_not_implemented() {
        assert!(matches!(
            AdvancedServoProtocol.buffer_size(),
            Err(ProtocolError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_encode_not_implemented() {
        assert!(matches!(
            AdvancedServoProtocol.encode(&[1500; 8]),
            Err(ProtocolError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_encode_checks_length_first() {
        assert_eq!(
            AdvancedServoProtocol.encode(&[1500; 4]),
            Err(ProtocolError::InvalidChannelCount {
                expected: 8,
                actual: 4
            })
        );
    }
}
