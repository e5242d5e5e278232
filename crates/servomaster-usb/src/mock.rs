//! 内存传输夹具
//!
//! 不依赖硬件的 `UsbBus` 实现：
//! - 记录每次主机到设备的控制传输
//! - 统计当前打开的句柄数（用于验证未选中的候选被释放）
//! - 可模拟拔出、传输失败、序列号读取失败

use crate::serial::encode_string_descriptor;
use crate::{
    REQUEST_GET_DESCRIPTOR, REQUEST_TYPE_STANDARD_IN, SERIAL_DESCRIPTOR_VALUE, UsbBus, UsbDevice,
    UsbDeviceError, UsbDeviceErrorKind, UsbHandle,
};
use parking_lot::Mutex;
use servomaster_protocol::{PHIDGETS_VENDOR_ID, product_ids};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

static NEXT_ADDRESS: AtomicUsize = AtomicUsize::new(1);

/// 一次被记录的控制传输
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTransfer {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

struct DeviceState {
    vendor_id: u16,
    product_id: u16,
    address: usize,
    serial_descriptor: Mutex<Vec<u8>>,
    connected: AtomicBool,
    fail_transfers: AtomicBool,
    fail_serial: AtomicBool,
    open_handles: AtomicUsize,
    opens: AtomicUsize,
    serial_reads: AtomicUsize,
    transfers: Mutex<Vec<ControlTransfer>>,
}

/// 模拟设备
///
/// 克隆共享同一份状态，测试持有一份克隆即可观察驱动侧的操作。
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<DeviceState>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16, serial: &str) -> Self {
        Self {
            state: Arc::new(DeviceState {
                vendor_id,
                product_id,
                address: NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed),
                serial_descriptor: Mutex::new(encode_string_descriptor(serial)),
                connected: AtomicBool::new(true),
                fail_transfers: AtomicBool::new(false),
                fail_serial: AtomicBool::new(false),
                open_handles: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
                serial_reads: AtomicUsize::new(0),
                transfers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 4 通道控制板
    pub fn quad_servo(serial: &str) -> Self {
        Self::new(PHIDGETS_VENDOR_ID, product_ids::QUAD_SERVO, serial)
    }

    /// 8 通道控制板
    pub fn advanced_servo(serial: &str) -> Self {
        Self::new(PHIDGETS_VENDOR_ID, product_ids::ADVANCED_SERVO, serial)
    }

    /// 替换原始序列号描述符字节
    pub fn with_serial_descriptor(self, raw: Vec<u8>) -> Self {
        *self.state.serial_descriptor.lock() = raw;
        self
    }

    /// 模拟插拔：断开后枚举不到，已打开的句柄返回 `NoDevice`
    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// 输出传输返回超时错误（设备仍然在线）
    pub fn set_fail_transfers(&self, fail: bool) {
        self.state.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// 序列号读取返回超时错误
    pub fn set_fail_serial(&self, fail: bool) {
        self.state.fail_serial.store(fail, Ordering::SeqCst);
    }

    pub fn open_handle_count(&self) -> usize {
        self.state.open_handles.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn serial_read_count(&self) -> usize {
        self.state.serial_reads.load(Ordering::SeqCst)
    }

    /// 已记录的输出传输
    pub fn transfers(&self) -> Vec<ControlTransfer> {
        self.state.transfers.lock().clone()
    }

    /// 最后一次输出传输的数据
    pub fn last_output(&self) -> Option<Vec<u8>> {
        self.state
            .transfers
            .lock()
            .last()
            .map(|transfer| transfer.data.clone())
    }

    pub fn clear_transfers(&self) {
        self.state.transfers.lock().clear();
    }

    fn disconnected_error() -> UsbDeviceError {
        UsbDeviceError::new(UsbDeviceErrorKind::NoDevice, "mock device unplugged")
    }
}

impl UsbDevice for MockDevice {
    fn vendor_id(&self) -> u16 {
        self.state.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.state.product_id
    }

    fn open(&self) -> Result<Box<dyn UsbHandle>, UsbDeviceError> {
        if !self.is_connected() {
            return Err(Self::disconnected_error());
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle {
            state: self.state.clone(),
        }))
    }

    fn location(&self) -> String {
        format!(
            "mock {:04x}:{:04x} @{}",
            self.state.vendor_id, self.state.product_id, self.state.address
        )
    }
}

struct MockHandle {
    state: Arc<DeviceState>,
}

impl UsbHandle for MockHandle {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbDeviceError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(MockDevice::disconnected_error());
        }

        if request_type != REQUEST_TYPE_STANDARD_IN
            || request != REQUEST_GET_DESCRIPTOR
            || value != SERIAL_DESCRIPTOR_VALUE
        {
            return Err(UsbDeviceError::new(
                UsbDeviceErrorKind::Pipe,
                format!("unsupported request 0x{:02x}/0x{:02x}", request_type, request),
            ));
        }

        self.state.serial_reads.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_serial.load(Ordering::SeqCst) {
            return Err(UsbDeviceError::new(
                UsbDeviceErrorKind::Timeout,
                "mock serial read timed out",
            ));
        }

        let descriptor = self.state.serial_descriptor.lock();
        let len = descriptor.len().min(buf.len());
        buf[..len].copy_from_slice(&descriptor[..len]);
        Ok(len)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbDeviceError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(MockDevice::disconnected_error());
        }

        if self.state.fail_transfers.load(Ordering::SeqCst) {
            return Err(UsbDeviceError::new(
                UsbDeviceErrorKind::Timeout,
                "mock transfer timed out",
            ));
        }

        self.state.transfers.lock().push(ControlTransfer {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });
        Ok(data.len())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 模拟总线
#[derive(Clone, Default)]
pub struct MockBus {
    devices: Arc<Mutex<Vec<MockDevice>>>,
    enumerations: Arc<AtomicUsize>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = MockDevice>) -> Self {
        let bus = Self::new();
        bus.devices.lock().extend(devices);
        bus
    }

    pub fn attach(&self, device: MockDevice) {
        self.devices.lock().push(device);
    }

    /// 从总线上移除（与 `set_connected(false)` 不同，重新连接也枚举不到）
    pub fn remove(&self, device: &MockDevice) {
        self.devices
            .lock()
            .retain(|attached| !Arc::ptr_eq(&attached.state, &device.state));
    }

    /// `devices()` 被调用的次数
    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

impl UsbBus for MockBus {
    fn devices(&self) -> Result<Vec<Box<dyn UsbDevice>>, UsbDeviceError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|device| device.is_connected())
            .map(|device| Box::new(device.clone()) as Box<dyn UsbDevice>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_count_tracks_drop() {
        let device = MockDevice::quad_servo("1");
        let first = device.open().unwrap();
        let second = device.open().unwrap();
        assert_eq!(device.open_handle_count(), 2);
        assert_eq!(device.open_count(), 2);

        drop(first);
        assert_eq!(device.open_handle_count(), 1);
        drop(second);
        assert_eq!(device.open_handle_count(), 0);
    }

    #[test]
    fn test_disconnected_device_is_not_enumerated() {
        let device = MockDevice::quad_servo("1");
        let bus = MockBus::with_devices([device.clone()]);
        assert_eq!(bus.devices().unwrap().len(), 1);

        device.set_connected(false);
        assert!(bus.devices().unwrap().is_empty());
        assert!(device.open().is_err());

        device.set_connected(true);
        assert_eq!(bus.devices().unwrap().len(), 1);
        assert_eq!(bus.enumeration_count(), 3);
    }

    #[test]
    fn test_remove() {
        let a = MockDevice::quad_servo("1");
        let b = MockDevice::quad_servo("2");
        let bus = MockBus::with_devices([a.clone(), b]);

        bus.remove(&a);
        assert_eq!(bus.devices().unwrap().len(), 1);
    }

    #[test]
    fn test_write_records_transfer() {
        let device = MockDevice::quad_servo("1");
        let handle = device.open().unwrap();
        handle
            .write_control(0x21, 0x09, 0x0200, 0, &[9, 8, 7], Duration::ZERO)
            .unwrap();
        assert_eq!(device.last_output(), Some(vec![9, 8, 7]));

        device.set_fail_transfers(true);
        let err = handle
            .write_control(0x21, 0x09, 0x0200, 0, &[1], Duration::ZERO)
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(device.transfers().len(), 1);
    }

    #[test]
    fn test_unplugged_handle_fails_with_no_device() {
        let device = MockDevice::quad_servo("1");
        let handle = device.open().unwrap();
        device.set_connected(false);

        let err = handle
            .write_control(0x21, 0x09, 0x0200, 0, &[1], Duration::ZERO)
            .unwrap_err();
        assert!(err.is_disconnect());
    }
}
