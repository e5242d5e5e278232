//! 设备上下文
//!
//! 每个与描述表匹配的已枚举设备对应一个 `DeviceContext`。它独占设备句柄，
//! 并在第一次需要时读取序列号。
//!
//! 序列号读取是显式的两阶段操作：
//! - [`DeviceContext::ensure_serial_fetched`]：可能执行 I/O，可能失败
//! - [`DeviceContext::serial`]：纯访问器
//!
//! Drop 时句柄随之释放（接口交还给操作系统）。

use crate::serial::parse_serial_descriptor;
use crate::{
    INTERFACE_NUMBER, OUTPUT_REPORT_VALUE, REQUEST_GET_DESCRIPTOR, REQUEST_SET_REPORT,
    REQUEST_TYPE_CLASS_OUT, REQUEST_TYPE_STANDARD_IN, SERIAL_DESCRIPTOR_LEN,
    SERIAL_DESCRIPTOR_VALUE, UsbDevice, UsbDeviceError, UsbDeviceErrorKind, UsbHandle,
};
use servomaster_protocol::DeviceDescriptor;
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

/// 已匹配描述表的设备
pub struct DeviceContext {
    device: Box<dyn UsbDevice>,
    descriptor: &'static DeviceDescriptor,
    handle: Option<Box<dyn UsbHandle>>,
    serial: Option<String>,
}

impl DeviceContext {
    pub fn new(device: Box<dyn UsbDevice>, descriptor: &'static DeviceDescriptor) -> Self {
        trace!(
            "Created: {} at {}",
            descriptor.model,
            device.location()
        );
        Self {
            device,
            descriptor,
            handle: None,
            serial: None,
        }
    }

    pub fn descriptor(&self) -> &'static DeviceDescriptor {
        self.descriptor
    }

    pub fn location(&self) -> String {
        self.device.location()
    }

    /// 句柄是否已打开
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// 已缓存的序列号（不执行 I/O）
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// 确保序列号已读取，返回缓存值
    ///
    /// 第一次调用时打开句柄并读取 16 字节字符串描述符；之后直接返回缓存。
    /// 描述符头不合法时序列号为空字符串（仍然缓存）。
    pub fn ensure_serial_fetched(&mut self, timeout: Duration) -> Result<&str, UsbDeviceError> {
        let serial = match self.serial.take() {
            Some(serial) => serial,
            None => self.fetch_serial(timeout)?,
        };
        Ok(self.serial.insert(serial).as_str())
    }

    fn fetch_serial(&mut self, timeout: Duration) -> Result<String, UsbDeviceError> {
        let mut buf = [0u8; SERIAL_DESCRIPTOR_LEN];
        let len = self.handle()?.read_control(
            REQUEST_TYPE_STANDARD_IN,
            REQUEST_GET_DESCRIPTOR,
            SERIAL_DESCRIPTOR_VALUE,
            0,
            &mut buf,
            timeout,
        )?;

        let serial = parse_serial_descriptor(&buf[..len.min(buf.len())]);
        debug!(
            "{} at {}: serial #{}",
            self.descriptor.model,
            self.device.location(),
            if serial.is_empty() { "<none>" } else { serial.as_str() }
        );
        Ok(serial)
    }

    /// 发送输出报告（整个命令缓冲区）
    ///
    /// 短写视为 I/O 错误。
    pub fn send_output(&mut self, data: &[u8], timeout: Duration) -> Result<(), UsbDeviceError> {
        let written = self.handle()?.write_control(
            REQUEST_TYPE_CLASS_OUT,
            REQUEST_SET_REPORT,
            OUTPUT_REPORT_VALUE,
            u16::from(INTERFACE_NUMBER),
            data,
            timeout,
        )?;

        if written != data.len() {
            return Err(UsbDeviceError::new(
                UsbDeviceErrorKind::Io,
                format!("short write: {} of {} bytes", written, data.len()),
            ));
        }
        Ok(())
    }

    /// 释放句柄，保留序列号缓存
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            trace!("Closed: {} at {}", self.descriptor.model, self.device.location());
        }
    }

    /// 按需打开句柄
    fn handle(&mut self) -> Result<&dyn UsbHandle, UsbDeviceError> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => self.device.open()?,
        };
        Ok(&**self.handle.insert(handle))
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("model", &self.descriptor.model)
            .field("location", &self.device.location())
            .field("open", &self.is_open())
            .field("serial", &self.serial)
            .finish()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        trace!(
            "Destroyed: {} at {}",
            self.descriptor.model,
            self.device.location()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use servomaster_protocol::find_descriptor;

    fn quad_context(device: &MockDevice) -> DeviceContext {
        let descriptor = find_descriptor(0x06C2, 0x0038).unwrap();
        DeviceContext::new(Box::new(device.clone()), descriptor)
    }

    #[test]
    fn test_serial_is_lazy() {
        let device = MockDevice::quad_servo("12345");
        let mut context = quad_context(&device);

        assert_eq!(context.serial(), None);
        assert!(!context.is_open());
        assert_eq!(device.open_handle_count(), 0);

        let serial = context.ensure_serial_fetched(Duration::from_millis(10)).unwrap();
        assert_eq!(serial, "12345");
        assert_eq!(context.serial(), Some("12345"));
        assert!(context.is_open());
        assert_eq!(device.open_handle_count(), 1);
    }

    #[test]
    fn test_serial_fetched_once() {
        let device = MockDevice::quad_servo("777");
        let mut context = quad_context(&device);

        for _ in 0..3 {
            context.ensure_serial_fetched(Duration::from_millis(10)).unwrap();
        }
        assert_eq!(device.serial_read_count(), 1);
    }

    #[test]
    fn test_serial_read_failure_is_not_cached() {
        let device = MockDevice::quad_servo("777");
        let mut context = quad_context(&device);

        device.set_connected(false);
        assert!(context.ensure_serial_fetched(Duration::from_millis(10)).is_err());
        assert_eq!(context.serial(), None);

        device.set_connected(true);
        assert_eq!(
            context.ensure_serial_fetched(Duration::from_millis(10)).unwrap(),
            "777"
        );
    }

    #[test]
    fn test_bad_header_gives_empty_serial() {
        let device = MockDevice::quad_servo("1").with_serial_descriptor(vec![12, 1, b'9', 0]);
        let mut context = quad_context(&device);

        assert_eq!(
            context.ensure_serial_fetched(Duration::from_millis(10)).unwrap(),
            ""
        );
        assert_eq!(context.serial(), Some(""));
    }

    #[test]
    fn test_send_output_uses_set_report() {
        let device = MockDevice::quad_servo("1");
        let mut context = quad_context(&device);

        context
            .send_output(&[1, 2, 3, 4, 5, 6], Duration::from_millis(10))
            .unwrap();

        let transfers = device.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].request_type, 0x21);
        assert_eq!(transfers[0].request, 0x09);
        assert_eq!(transfers[0].value, 0x0200);
        assert_eq!(transfers[0].index, 0);
        assert_eq!(transfers[0].data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_drop_releases_handle() {
        let device = MockDevice::quad_servo("1");
        {
            let mut context = quad_context(&device);
            context.ensure_serial_fetched(Duration::from_millis(10)).unwrap();
            assert_eq!(device.open_handle_count(), 1);
        }
        assert_eq!(device.open_handle_count(), 0);
    }

    #[test]
    fn test_close_keeps_serial() {
        let device = MockDevice::quad_servo("42");
        let mut context = quad_context(&device);
        context.ensure_serial_fetched(Duration::from_millis(10)).unwrap();

        context.close();
        assert!(!context.is_open());
        assert_eq!(device.open_handle_count(), 0);
        assert_eq!(context.serial(), Some("42"));
    }
}
