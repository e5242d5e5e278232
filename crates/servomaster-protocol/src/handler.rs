//! 协议处理器
//!
//! 每种控制板型号对应一个 `ProtocolHandler` 实现：它知道板子有几个通道，
//! 以及如何把所有通道的脉宽打包成一个命令缓冲区。

use crate::advanced_servo::AdvancedServoProtocol;
use crate::quad_servo::QuadServoProtocol;
use crate::{DESCRIPTOR_TABLE, ProtocolError};
use std::fmt;

/// 协议处理器 Trait
///
/// # 纯函数约定
///
/// `encode()` 除返回的缓冲区外不得持有任何隐藏状态：给定同样的脉宽数组，
/// 必须返回同样的字节。调用方（驱动层）负责保存脉宽数组。
pub trait ProtocolHandler: Send + Sync + fmt::Debug {
    /// 型号名称
    fn model(&self) -> &'static str;

    /// 通道数（每个型号固定）
    fn channel_count(&self) -> usize;

    /// 命令缓冲区大小（字节）
    fn buffer_size(&self) -> Result<usize, ProtocolError>;

    /// 将 `channel_count()` 个脉宽值编码为命令缓冲区
    ///
    /// # 错误
    /// - `ProtocolError::InvalidChannelCount`: 数组长度与通道数不一致
    fn encode(&self, raw_positions: &[u16]) -> Result<Vec<u8>, ProtocolError>;

    /// 让所有输出停止脉冲的缓冲区
    ///
    /// 默认实现：全零缓冲区。
    fn silence_buffer(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(vec![0u8; self.buffer_size()?])
    }
}

/// 协议种类（描述表中的标签）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolKind {
    /// 4 通道，6 字节缓冲区
    QuadServo,
    /// 8 通道，编码未实现
    AdvancedServo,
}

impl ProtocolKind {
    /// 创建该协议的处理器实例
    pub fn handler(self) -> Box<dyn ProtocolHandler> {
        match self {
            Self::QuadServo => Box::new(QuadServoProtocol),
            Self::AdvancedServo => Box::new(AdvancedServoProtocol),
        }
    }
}

/// 按 `protocol_handler_id`（`(vendor_id << 16) | product_id`）创建处理器
///
/// 在初始化时调用一次，结果由控制器持有。
///
/// # 错误
/// - `ProtocolError::UnsupportedDevice`: 描述表中没有该 ID
pub fn handler_for_id(handler_id: u32) -> Result<Box<dyn ProtocolHandler>, ProtocolError> {
    DESCRIPTOR_TABLE
        .iter()
        .find(|descriptor| descriptor.protocol_handler_id() == handler_id)
        .map(|descriptor| descriptor.kind.handler())
        .ok_or(ProtocolError::UnsupportedDevice { handler_id })
}
