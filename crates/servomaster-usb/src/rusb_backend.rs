//! libusb 后端（通过 rusb）

use crate::{INTERFACE_NUMBER, UsbBus, UsbDevice, UsbDeviceError, UsbDeviceErrorKind, UsbHandle};
use rusb::{Device, DeviceHandle, GlobalContext};
use std::time::Duration;
use tracing::trace;

impl From<rusb::Error> for UsbDeviceError {
    fn from(err: rusb::Error) -> Self {
        let kind = match err {
            rusb::Error::NotFound => UsbDeviceErrorKind::NotFound,
            rusb::Error::NoDevice => UsbDeviceErrorKind::NoDevice,
            rusb::Error::Access => UsbDeviceErrorKind::AccessDenied,
            rusb::Error::Busy => UsbDeviceErrorKind::Busy,
            rusb::Error::Timeout => UsbDeviceErrorKind::Timeout,
            rusb::Error::Pipe => UsbDeviceErrorKind::Pipe,
            rusb::Error::Io => UsbDeviceErrorKind::Io,
            _ => UsbDeviceErrorKind::Backend,
        };
        UsbDeviceError::new(kind, err.to_string())
    }
}

/// 系统 USB 总线（libusb 全局上下文）
#[derive(Debug, Clone, Copy, Default)]
pub struct RusbBus;

impl UsbBus for RusbBus {
    fn devices(&self) -> Result<Vec<Box<dyn UsbDevice>>, UsbDeviceError> {
        let mut found: Vec<Box<dyn UsbDevice>> = Vec::new();

        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };

            found.push(Box::new(RusbDevice {
                device,
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            }));
        }

        Ok(found)
    }
}

/// 已枚举的 libusb 设备
pub struct RusbDevice {
    device: Device<GlobalContext>,
    vendor_id: u16,
    product_id: u16,
}

impl UsbDevice for RusbDevice {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn open(&self) -> Result<Box<dyn UsbHandle>, UsbDeviceError> {
        let handle = self.device.open()?;
        let mut handle = RusbHandle {
            handle,
            interface_claimed: false,
        };
        handle.prepare_interface()?;
        Ok(Box::new(handle))
    }

    fn location(&self) -> String {
        format!(
            "bus {:03} address {:03}",
            self.device.bus_number(),
            self.device.address()
        )
    }
}

/// 已打开的 libusb 句柄
///
/// Drop 时释放接口，避免下次打开时 claim 失败（Access denied）。
pub struct RusbHandle {
    handle: DeviceHandle<GlobalContext>,
    interface_claimed: bool,
}

impl RusbHandle {
    /// 准备接口（detach driver 和 claim interface）
    fn prepare_interface(&mut self) -> Result<(), UsbDeviceError> {
        if self.interface_claimed {
            return Ok(());
        }

        // 控制板枚举为 HID 设备，Linux/macOS 上需要先摘掉内核驱动
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if self.handle.kernel_driver_active(INTERFACE_NUMBER).unwrap_or(false) {
                self.handle.detach_kernel_driver(INTERFACE_NUMBER)?;
            }
        }

        self.handle.claim_interface(INTERFACE_NUMBER)?;
        self.interface_claimed = true;

        Ok(())
    }

    /// 释放 USB 接口（交还给操作系统）
    pub fn release_interface(&mut self) {
        if self.interface_claimed {
            // 设备可能已断开，忽略错误
            let _ = self.handle.release_interface(INTERFACE_NUMBER);
            self.interface_claimed = false;
            trace!("[Release] USB Interface released");
        }
    }
}

impl UsbHandle for RusbHandle {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbDeviceError> {
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbDeviceError> {
        Ok(self
            .handle
            .write_control(request_type, request, value, index, data, timeout)?)
    }
}

impl Drop for RusbHandle {
    fn drop(&mut self) {
        self.release_interface();
    }
}
