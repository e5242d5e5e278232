//! 4 通道控制板（QuadServo）命令缓冲区
//!
//! 四个 12 bit 脉宽值打包为 6 字节，两两共享一个半字节：
//!
//! ```text
//! byte 0: ch0[7:0]
//! byte 1: ch1[11:8] << 4 | ch0[11:8]
//! byte 2: ch1[7:0]
//! byte 3: ch2[7:0]
//! byte 4: ch3[11:8] << 4 | ch2[11:8]
//! byte 5: ch3[7:0]
//! ```
//!
//! 注意两组的低字节位置不对称：通道 1 的低字节在共享字节之后（byte 2），
//! 通道 2 的低字节在共享字节之前（byte 3）。

use crate::handler::ProtocolHandler;
use crate::{MAX_PULSE_VALUE, ProtocolError};

/// 通道数
pub const QUAD_SERVO_CHANNELS: usize = 4;

/// 命令缓冲区大小
pub const QUAD_SERVO_BUFFER_SIZE: usize = 6;

/// QuadServo 协议处理器
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadServoProtocol;

impl QuadServoProtocol {
    /// Pack into bytes for USB transfer (6 bytes)
    pub fn pack(positions: &[u16; QUAD_SERVO_CHANNELS]) -> [u8; QUAD_SERVO_BUFFER_SIZE] {
        let [p0, p1, p2, p3] = *positions;
        let mut buf = [0u8; QUAD_SERVO_BUFFER_SIZE];

        buf[0] = (p0 & 0xFF) as u8;
        buf[1] = ((p0 >> 8) & 0x0F) as u8 | (((p1 >> 8) & 0x0F) as u8) << 4;
        buf[2] = (p1 & 0xFF) as u8;

        buf[3] = (p2 & 0xFF) as u8;
        buf[4] = ((p2 >> 8) & 0x0F) as u8 | (((p3 >> 8) & 0x0F) as u8) << 4;
        buf[5] = (p3 & 0xFF) as u8;

        buf
    }

    /// Unpack a 6-byte command buffer back into four 12-bit pulse values
    pub fn unpack(buf: &[u8; QUAD_SERVO_BUFFER_SIZE]) -> [u16; QUAD_SERVO_CHANNELS] {
        [
            u16::from(buf[0]) | u16::from(buf[1] & 0x0F) << 8,
            u16::from(buf[2]) | u16::from(buf[1] >> 4) << 8,
            u16::from(buf[3]) | u16::from(buf[4] & 0x0F) << 8,
            u16::from(buf[5]) | u16::from(buf[4] >> 4) << 8,
        ]
    }
}

impl ProtocolHandler for QuadServoProtocol {
    fn model(&self) -> &'static str {
        "QuadServo"
    }

    fn channel_count(&self) -> usize {
        QUAD_SERVO_CHANNELS
    }

    fn buffer_size(&self) -> Result<usize, ProtocolError> {
        Ok(QUAD_SERVO_BUFFER_SIZE)
    }

    fn encode(&self, raw_positions: &[u16]) -> Result<Vec<u8>, ProtocolError> {
        let positions: &[u16; QUAD_SERVO_CHANNELS] =
            raw_positions
                .try_into()
                .map_err(|_| ProtocolError::InvalidChannelCount {
                    expected: QUAD_SERVO_CHANNELS,
                    actual: raw_positions.len(),
                })?;

        // 超过 12 bit 的值会污染相邻通道的半字节
        if let Some((channel, &value)) = positions
            .iter()
            .enumerate()
            .find(|(_, value)| **value > MAX_PULSE_VALUE)
        {
            return Err(ProtocolError::PulseOutOfRange { channel, value });
        }

        Ok(Self::pack(positions).to_vec())
    }
}
