//! # Servomaster Protocol
//!
//! USB 舵机控制板协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `descriptor`: 已识别控制板的描述表（Vendor ID / Product ID → 型号）
//! - `handler`: `ProtocolHandler` trait 及按 ID 分发
//! - `quad_servo`: 4 通道控制板的命令缓冲区编码
//! - `advanced_servo`: 8 通道控制板（编码格式尚未公开）
//!
//! ## 数据单位
//!
//! 协议层只处理设备原生单位（脉宽，微秒）。归一化位置（0.0–1.0）到脉宽的映射
//! 由驱动层负责，本 crate 的编码函数是纯函数：给定同样的脉宽数组，总是返回同样的缓冲区。

pub mod advanced_servo;
pub mod descriptor;
pub mod handler;
pub mod quad_servo;

// 重新导出常用类型
pub use advanced_servo::AdvancedServoProtocol;
pub use descriptor::*;
pub use handler::{ProtocolHandler, ProtocolKind, handler_for_id};
pub use quad_servo::QuadServoProtocol;

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid channel count: expected {expected}, got {actual}")]
    InvalidChannelCount { expected: usize, actual: usize },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Unsupported device: vendor/product ID 0x{handler_id:08X}")]
    UnsupportedDevice { handler_id: u32 },

    #[error("Pulse value {value} on channel {channel} does not fit in 12 bits")]
    PulseOutOfRange { channel: usize, value: u16 },
}

/// 单个通道脉宽字段的最大值（12 bit）
pub const MAX_PULSE_VALUE: u16 = 0x0FFF;
