//! 控制板描述表
//!
//! 静态列出所有已识别的控制板型号。设备发现时，只有 (Vendor ID, Product ID)
//! 出现在本表中的 USB 设备才会被视为候选。

use crate::handler::ProtocolKind;

// ============================================================================
// USB Identifiers
// ============================================================================

/// Phidgets, Inc. USB Vendor ID
pub const PHIDGETS_VENDOR_ID: u16 = 0x06C2;

/// 已知的 Product ID
pub mod product_ids {
    /// PhidgetServo 4-Motor（QuadServo）
    pub const QUAD_SERVO: u16 = 0x0038;
    /// PhidgetAdvancedServo 8-Motor
    pub const ADVANCED_SERVO: u16 = 0x003B;
}

/// 控制板描述符
///
/// 不可变，描述一种已识别的控制板型号。`protocol_handler_id()` 派生出
/// `(vendor_id << 16) | product_id` 复合键，用于选择协议处理器。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceDescriptor {
    /// 型号名称
    pub model: &'static str,
    /// 厂商名称
    pub manufacturer: &'static str,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// 该型号使用的协议
    pub kind: ProtocolKind,
}

impl DeviceDescriptor {
    pub const fn new(
        model: &'static str,
        vendor_id: u16,
        product_id: u16,
        kind: ProtocolKind,
    ) -> Self {
        Self {
            model,
            manufacturer: "Phidgets, Inc.",
            vendor_id,
            product_id,
            kind,
        }
    }

    /// 协议处理器分发键：`(vendor_id << 16) | product_id`
    pub const fn protocol_handler_id(&self) -> u32 {
        ((self.vendor_id as u32) << 16) | self.product_id as u32
    }

    /// 检查 USB 标识是否属于本型号
    pub const fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// 已识别控制板列表
pub static DESCRIPTOR_TABLE: &[DeviceDescriptor] = &[
    DeviceDescriptor::new(
        "QuadServo",
        PHIDGETS_VENDOR_ID,
        product_ids::QUAD_SERVO,
        ProtocolKind::QuadServo,
    ),
    DeviceDescriptor::new(
        "AdvancedServo",
        PHIDGETS_VENDOR_ID,
        product_ids::ADVANCED_SERVO,
        ProtocolKind::AdvancedServo,
    ),
];

/// 按 USB 标识查找描述符
pub fn find_descriptor(vendor_id: u16, product_id: u16) -> Option<&'static DeviceDescriptor> {
    DESCRIPTOR_TABLE
        .iter()
        .find(|descriptor| descriptor.matches(vendor_id, product_id))
}
