//! USB 传输边界与设备发现
//!
//! 本 crate 不实现 USB 协议栈，只把底层传输抽象成三个能力：
//!
//! - [`UsbBus`]：枚举已连接设备
//! - [`UsbDevice`]：报告 Vendor/Product ID，打开句柄
//! - [`UsbHandle`]：执行控制传输（读字符串描述符、发送输出报告）
//!
//! 在这之上提供 [`DeviceContext`]（一个已匹配描述表的设备）与
//! [`select_device`]（从候选中唯一选出一个控制板）。
//!
//! # 后端
//!
//! - `rusb`（默认）：libusb 后端
//! - `mock`：内存夹具，记录控制传输并统计打开的句柄，供测试使用

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod context;
pub mod selector;
pub mod serial;

#[cfg(feature = "rusb")]
pub mod rusb_backend;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use context::DeviceContext;
pub use selector::{DiscoveryError, select_device};
pub use serial::parse_serial_descriptor;

#[cfg(feature = "rusb")]
pub use rusb_backend::{RusbBus, RusbDevice, RusbHandle};

// ============================================================================
// Control Transfer Constants
// ============================================================================

/// bmRequestType: Device-to-Host | Standard | Device
pub const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;

/// bmRequestType: Host-to-Device | Class | Interface
pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;

/// GET_DESCRIPTOR
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// HID SET_REPORT
pub const REQUEST_SET_REPORT: u8 = 0x09;

/// wValue：字符串描述符（类型 0x03），索引 3
pub const SERIAL_DESCRIPTOR_VALUE: u16 = 0x0303;

/// wValue：输出报告（类型 0x02），报告 ID 0
pub const OUTPUT_REPORT_VALUE: u16 = 0x0200;

/// 控制板只有一个接口
pub const INTERFACE_NUMBER: u8 = 0;

/// 序列号描述符读取长度（字节）
pub const SERIAL_DESCRIPTOR_LEN: usize = 16;

/// 默认传输超时
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(5000);

// ============================================================================
// Errors
// ============================================================================

/// 传输错误分类（与后端无关）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    Busy,
    Timeout,
    Pipe,
    Io,
    Backend,
}

/// 结构化传输错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct UsbDeviceError {
    pub kind: UsbDeviceErrorKind,
    pub message: String,
}

impl UsbDeviceError {
    pub fn new(kind: UsbDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 句柄已失效，需要重新发现设备
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.kind,
            UsbDeviceErrorKind::NoDevice | UsbDeviceErrorKind::NotFound | UsbDeviceErrorKind::Io
        )
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        self.kind == UsbDeviceErrorKind::Timeout
    }
}

impl From<String> for UsbDeviceError {
    fn from(message: String) -> Self {
        Self::new(UsbDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for UsbDeviceError {
    fn from(message: &str) -> Self {
        Self::new(UsbDeviceErrorKind::Unknown, message)
    }
}

// ============================================================================
// Transport Capabilities
// ============================================================================

/// 总线：枚举当前连接的设备
pub trait UsbBus: Send + Sync {
    fn devices(&self) -> Result<Vec<Box<dyn UsbDevice>>, UsbDeviceError>;
}

/// 已枚举、尚未打开的设备
pub trait UsbDevice: Send + Sync {
    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    /// 打开设备并准备接口
    ///
    /// 返回的句柄在 Drop 时释放接口。
    fn open(&self) -> Result<Box<dyn UsbHandle>, UsbDeviceError>;

    /// 日志用的位置描述（例如总线号与地址）
    fn location(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id(), self.product_id())
    }
}

/// 已打开的设备句柄
pub trait UsbHandle: Send + Sync {
    /// 设备到主机的控制传输，返回实际读取的字节数
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbDeviceError>;

    /// 主机到设备的控制传输，返回实际写入的字节数
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbDeviceError>;
}

impl fmt::Debug for dyn UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("vendor_id", &format_args!("0x{:04X}", self.vendor_id()))
            .field("product_id", &format_args!("0x{:04X}", self.product_id()))
            .field("location", &self.location())
            .finish()
    }
}
