//! 设备选择
//!
//! 从已枚举设备中按描述表过滤出候选，并唯一选出一个：
//!
//! - 未指定序列号：候选必须恰好一个
//! - 指定序列号：逐个读取候选的序列号，返回第一个完全匹配的
//!
//! 未被选中的候选在返回前全部 Drop，句柄随之释放。

use crate::{DeviceContext, UsbDevice, UsbDeviceError};
use servomaster_protocol::find_descriptor;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// 设备发现错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// 未指定序列号时，候选不是恰好一个
    #[error("Expected exactly one servo controller, found {found}")]
    AmbiguousOrMissingDevice { found: usize },

    /// 没有候选的序列号与请求一致
    #[error("Servo controller with serial #{serial} not found")]
    DeviceNotFound { serial: String },

    /// 枚举总线失败
    #[error("USB error: {0}")]
    Usb(#[from] UsbDeviceError),
}

impl DiscoveryError {
    /// 重新连接可能解决的错误
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            DiscoveryError::AmbiguousOrMissingDevice { found: 0 }
                | DiscoveryError::DeviceNotFound { .. }
        )
    }
}

/// 从已枚举设备中选出一个控制板
///
/// # 参数
/// - `devices`: 总线上枚举到的全部设备
/// - `wanted_serial`: 可选的序列号过滤器（大小写敏感，完全匹配）
/// - `serial_timeout`: 读取序列号描述符的超时
///
/// # 注意
/// - 指定序列号时，序列号读取失败的候选被跳过（记录警告）
/// - 返回的 `DeviceContext` 如果读过序列号，句柄保持打开供后续发送复用
pub fn select_device(
    devices: Vec<Box<dyn UsbDevice>>,
    wanted_serial: Option<&str>,
    serial_timeout: Duration,
) -> Result<DeviceContext, DiscoveryError> {
    let mut candidates: Vec<DeviceContext> = devices
        .into_iter()
        .filter_map(|device| {
            match find_descriptor(device.vendor_id(), device.product_id()) {
                Some(descriptor) => {
                    debug!("Candidate: {} at {}", descriptor.model, device.location());
                    Some(DeviceContext::new(device, descriptor))
                },
                None => {
                    trace!("Ignoring unknown device {}", device.location());
                    None
                },
            }
        })
        .collect();

    let Some(wanted) = wanted_serial else {
        if candidates.len() != 1 {
            return Err(DiscoveryError::AmbiguousOrMissingDevice {
                found: candidates.len(),
            });
        }
        return candidates
            .pop()
            .ok_or(DiscoveryError::AmbiguousOrMissingDevice { found: 0 });
    };

    // 候选为空时不做任何序列号读取
    if candidates.is_empty() {
        return Err(DiscoveryError::DeviceNotFound {
            serial: wanted.to_string(),
        });
    }

    for mut candidate in candidates {
        let matched = match candidate.ensure_serial_fetched(serial_timeout) {
            Ok(serial) => {
                if serial != wanted {
                    trace!("Serial #{} does not match #{}", serial, wanted);
                }
                serial == wanted
            },
            Err(e) => {
                warn!(
                    "Skipping {} at {}: failed to read serial: {}",
                    candidate.descriptor().model,
                    candidate.location(),
                    e
                );
                false
            },
        };

        if matched {
            debug!(
                "Selected {} serial #{} at {}",
                candidate.descriptor().model,
                wanted,
                candidate.location()
            );
            return Ok(candidate);
        }
    }

    Err(DiscoveryError::DeviceNotFound {
        serial: wanted.to_string(),
    })
}
