//! 控制器端到端测试（内存夹具总线）

use servomaster_driver::{
    ControllerCallback, ControllerConfig, ControllerStatus, DriverError, Servo, ServoController,
    ServoControllerBuilder, TransferRecorder,
};
use servomaster_protocol::{ProtocolError, QuadServoProtocol};
use servomaster_usb::UsbDeviceError;
use servomaster_usb::mock::{MockBus, MockDevice};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

fn ready_controller(serial: &str) -> (ServoController, MockDevice, MockBus) {
    let device = MockDevice::quad_servo(serial);
    let bus = MockBus::with_devices([device.clone()]);
    let controller = ServoController::new(bus.clone());
    controller.init(None).unwrap();
    (controller, device, bus)
}

fn last_pulses(device: &MockDevice) -> [u16; 4] {
    let buffer = device.last_output().expect("no output transfer recorded");
    let buffer: [u8; 6] = buffer.try_into().expect("unexpected buffer size");
    QuadServoProtocol::unpack(&buffer)
}

#[test]
fn test_full_position_on_channel_zero() {
    let (controller, device, _bus) = ready_controller("1");

    controller.get_servo(0).unwrap().set_position(1.0).unwrap();

    assert_eq!(controller.raw_positions(), vec![2000, 0, 0, 0]);
    let transfers = device.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].request_type, 0x21);
    assert_eq!(transfers[0].request, 0x09);
    assert_eq!(transfers[0].value, 0x0200);
    assert_eq!(transfers[0].index, 0);
    assert_eq!(transfers[0].data[0], 208);
}

#[test]
fn test_every_commit_sends_whole_buffer() {
    let (controller, device, _bus) = ready_controller("1");

    controller.get_servo(0).unwrap().set_position(0.0).unwrap();
    controller.get_servo(1).unwrap().set_position(0.5).unwrap();
    controller.get_servo(2).unwrap().set_position(1.0).unwrap();
    controller.get_servo(3).unwrap().set_position(0.75).unwrap();

    assert_eq!(device.transfers().len(), 4);
    assert_eq!(last_pulses(&device), [1000, 1500, 2000, 1750]);
    assert_eq!(
        device.last_output().unwrap(),
        vec![0xE8, 0x53, 0xDC, 0xD0, 0x67, 0xD6]
    );
}

#[test]
fn test_get_servo_identity() {
    let (controller, _device, _bus) = ready_controller("1");

    let first = controller.get_servo(2).unwrap();
    let second = controller.get_servo(2).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(controller.servos().len(), 1);
    assert_eq!(controller.metrics().snapshot().servos_created, 1);
}

#[test]
fn test_get_servo_invalid_channel() {
    let (controller, _device, _bus) = ready_controller("1");

    assert!(matches!(
        controller.get_servo(4),
        Err(DriverError::InvalidChannel {
            channel: 4,
            channel_count: 4
        })
    ));
}

#[test]
fn test_init_twice() {
    let (controller, _device, _bus) = ready_controller("1");
    assert!(matches!(
        controller.init(None),
        Err(DriverError::AlreadyInitialized)
    ));
    assert_eq!(controller.status(), ControllerStatus::Ready);
}

#[test]
fn test_init_without_devices() {
    let controller = ServoController::new(MockBus::new());
    let error = controller.init(None).unwrap_err();
    assert!(error.is_discovery());
    assert!(error.to_string().contains("found 0"));
}

#[test]
fn test_init_with_two_devices_and_no_serial() {
    let bus = MockBus::with_devices([MockDevice::quad_servo("1"), MockDevice::quad_servo("2")]);
    let controller = ServoController::new(bus);
    let error = controller.init(None).unwrap_err();
    assert!(error.to_string().contains("found 2"));
}

#[test]
fn test_init_with_unknown_serial() {
    let (device_a, device_b) = (MockDevice::quad_servo("1"), MockDevice::quad_servo("2"));
    let bus = MockBus::with_devices([device_a.clone(), device_b.clone()]);
    let controller = ServoController::new(bus);

    let error = controller.init(Some("3")).unwrap_err();
    assert!(error.to_string().contains("#3"));
    assert_eq!(device_a.open_handle_count(), 0);
    assert_eq!(device_b.open_handle_count(), 0);
}

#[test]
fn test_init_ignores_unrecognized_devices() {
    let bus = MockBus::with_devices([
        MockDevice::new(0x1234, 0x5678, "99"),
        MockDevice::quad_servo("1"),
    ]);
    let controller = ServoController::new(bus);
    controller.init(None).unwrap();
    assert_eq!(controller.meta().unwrap().model, "QuadServo");
}

#[test]
fn test_advanced_servo_send_not_implemented() {
    let device = MockDevice::advanced_servo("8");
    let controller = ServoController::new(MockBus::with_devices([device.clone()]));
    controller.init(None).unwrap();

    assert_eq!(controller.channel_count().unwrap(), 8);
    let servo = controller.get_servo(7).unwrap();
    assert!(matches!(
        servo.set_position(0.5),
        Err(DriverError::Protocol(ProtocolError::NotImplemented(_)))
    ));
    assert!(device.transfers().is_empty());
}

#[test]
fn test_transmission_failure_keeps_controller_usable() {
    let (controller, device, _bus) = ready_controller("1");
    let servo = controller.get_servo(0).unwrap();

    device.set_fail_transfers(true);
    let error = servo.set_position(0.5).unwrap_err();
    assert!(error.is_transmission());
    assert_eq!(servo.position(), 0.5);
    assert_eq!(servo.actual_position(), 0.0);
    assert_eq!(controller.status(), ControllerStatus::Ready);

    device.set_fail_transfers(false);
    servo.set_position(0.5).unwrap();
    assert_eq!(servo.actual_position(), 0.5);

    let snapshot = controller.metrics().snapshot();
    assert_eq!(snapshot.transfer_errors, 1);
    assert_eq!(snapshot.transfers_total, 1);
}

#[test]
fn test_rediscovery_after_unplug() {
    let (controller, device, bus) = ready_controller("77");
    let servo = controller.get_servo(1).unwrap();
    servo.set_position(0.25).unwrap();

    device.set_connected(false);
    assert!(servo.set_position(0.5).unwrap_err().is_transmission());
    assert_eq!(controller.status(), ControllerStatus::Disconnected);
    assert_eq!(device.open_handle_count(), 0);

    // 仍未插回：重新发现失败，状态不变
    assert!(servo.set_position(0.5).unwrap_err().is_discovery());
    assert_eq!(controller.status(), ControllerStatus::Disconnected);

    device.set_connected(true);
    let enumerations = bus.enumeration_count();
    servo.set_position(0.5).unwrap();

    assert_eq!(bus.enumeration_count(), enumerations + 1);
    assert_eq!(controller.status(), ControllerStatus::Ready);
    assert_eq!(last_pulses(&device), [0, 1500, 0, 0]);
    assert_eq!(controller.metrics().snapshot().rediscoveries, 1);
}

#[test]
fn test_rediscovery_on_replugged_device() {
    let (controller, device, bus) = ready_controller("77");

    device.set_connected(false);
    assert!(controller.send().is_err());
    bus.remove(&device);

    let replugged = MockDevice::quad_servo("77");
    bus.attach(replugged.clone());
    controller.send().unwrap();

    assert_eq!(replugged.transfers().len(), 1);
    assert_eq!(replugged.open_handle_count(), 1);
}

#[test]
fn test_rediscovery_rejects_different_model() {
    let (controller, device, bus) = ready_controller("77");

    device.set_connected(false);
    assert!(controller.send().is_err());
    bus.remove(&device);
    bus.attach(MockDevice::advanced_servo("77"));

    assert!(matches!(
        controller.send(),
        Err(DriverError::DeviceChanged {
            expected: "QuadServo",
            found: "AdvancedServo"
        })
    ));
}

#[test]
fn test_rediscovery_disabled() {
    let device = MockDevice::quad_servo("1");
    let bus = MockBus::with_devices([device.clone()]);
    let config = ControllerConfig {
        rediscover_on_send: false,
        ..Default::default()
    };
    let controller = ServoControllerBuilder::new()
        .bus(bus.clone())
        .config(config)
        .build()
        .unwrap();
    controller.init(None).unwrap();

    device.set_connected(false);
    assert!(controller.send().is_err());
    device.set_connected(true);

    let enumerations = bus.enumeration_count();
    assert!(controller.send().unwrap_err().is_transmission());
    assert_eq!(bus.enumeration_count(), enumerations);
}

#[test]
fn test_silence_and_reset() {
    let (controller, device, _bus) = ready_controller("1");
    controller.get_servo(0).unwrap().set_position(0.5).unwrap();

    controller.silence().unwrap();
    assert_eq!(device.last_output().unwrap(), vec![0u8; 6]);
    assert_eq!(controller.raw_positions(), vec![1500, 0, 0, 0]);

    controller.reset().unwrap();
    assert_eq!(last_pulses(&device), [1500, 0, 0, 0]);
}

#[test]
fn test_set_range_recommits_position() {
    let (controller, device, _bus) = ready_controller("1");
    let servo = controller.get_servo(0).unwrap();

    servo.set_range(500, 2500).unwrap();
    assert!(device.transfers().is_empty());

    servo.set_position(0.5).unwrap();
    assert_eq!(last_pulses(&device), [1500, 0, 0, 0]);

    servo.set_range(1000, 3000).unwrap();
    assert_eq!(last_pulses(&device), [2000, 0, 0, 0]);
    assert_eq!(servo.actual_position(), 0.5);
}

#[test]
fn test_reversed_servo() {
    let (controller, device, _bus) = ready_controller("1");
    let hardware = controller.get_servo(0).unwrap();
    let reversed = Servo::reversed(&hardware);

    reversed.set_position(0.25).unwrap();
    assert_eq!(hardware.actual_position(), 0.75);
    assert_eq!(reversed.actual_position(), 0.25);
    assert_eq!(last_pulses(&device), [1750, 0, 0, 0]);
}

#[test]
fn test_linear_servo() {
    let (controller, device, _bus) = ready_controller("1");
    let hardware = controller.get_servo(1).unwrap();
    let linear = Servo::linear(&hardware, 0.0, 180.0).unwrap();

    linear.set_position(0.5).unwrap();
    assert_eq!(last_pulses(&device), [0, 1500, 0, 0]);

    // 位移 0.25 对应 60°
    linear.set_position(0.25).unwrap();
    assert_eq!(last_pulses(&device), [0, 1333, 0, 0]);

    assert!(matches!(
        Servo::linear(&hardware, 90.0, 45.0),
        Err(DriverError::InvalidAngles { .. })
    ));
}

#[test]
fn test_stacked_transforms() {
    let (controller, device, _bus) = ready_controller("1");
    let hardware = controller.get_servo(3).unwrap();
    let linear = Servo::linear(&Servo::reversed(&hardware), 0.0, 180.0).unwrap();

    linear.set_position(0.5).unwrap();
    assert_eq!(last_pulses(&device), [0, 0, 0, 1500]);
    assert_eq!(linear.channel(), 3);
    assert_eq!(linear.name(), "linear(reversed(3))");
}

#[test]
fn test_scaled_servo() {
    let (controller, device, _bus) = ready_controller("1");
    let hardware = controller.get_servo(2).unwrap();
    let scaled = Servo::scaled(&hardware, 0.5, 0.25).unwrap();

    scaled.set_position(1.0).unwrap();
    assert_eq!(hardware.actual_position(), 0.75);
    assert_eq!(last_pulses(&device), [0, 0, 1750, 0]);
    assert_eq!(scaled.name(), "scaled(2)");

    assert!(matches!(
        Servo::scaled(&hardware, 0.0, 0.5),
        Err(DriverError::InvalidScale { .. })
    ));

    // 变换结果超出范围时由目标舵机拒绝，不发送
    let shifted = Servo::scaled(&hardware, 1.0, 0.5).unwrap();
    let sent = device.transfers().len();
    assert!(matches!(
        shifted.set_position(0.75),
        Err(DriverError::PositionOutOfRange(_))
    ));
    assert_eq!(device.transfers().len(), sent);
}

#[test]
fn test_sine_and_cosine_servos() {
    let (controller, device, _bus) = ready_controller("1");
    let sine = Servo::sine(&controller.get_servo(0).unwrap());
    let cosine = Servo::cosine(&controller.get_servo(1).unwrap());

    sine.set_position(0.5).unwrap();
    cosine.set_position(1.0).unwrap();

    // sin 0.5 = 0.4794..., cos 1.0 = 0.5403...
    assert_eq!(last_pulses(&device), [1479, 1540, 0, 0]);
    assert_eq!(sine.name(), "sine(0)");
    assert_eq!(cosine.name(), "cosine(1)");
}

#[derive(Default)]
struct CountingCallback {
    transfers: AtomicUsize,
    failures: AtomicUsize,
    requested: AtomicUsize,
    committed: AtomicUsize,
    disconnects: AtomicUsize,
    reconnects: AtomicUsize,
}

impl ControllerCallback for CountingCallback {
    fn on_transfer(&self, _buffer: &[u8]) {
        self.transfers.fetch_add(1, Ordering::SeqCst);
    }

    fn on_transfer_failed(&self, _error: &UsbDeviceError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn on_position_requested(&self, _channel: usize, _position: f64) {
        self.requested.fetch_add(1, Ordering::SeqCst);
    }

    fn on_actual_position(&self, _channel: usize, _position: f64) {
        self.committed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reconnect(&self, serial: Option<&str>) {
        assert_eq!(serial, Some("5"));
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_callbacks() {
    let (controller, device, _bus) = ready_controller("5");
    let callback = Arc::new(CountingCallback::default());
    controller.add_callback(callback.clone());

    let servo = controller.get_servo(0).unwrap();
    servo.set_position(0.1).unwrap();

    device.set_connected(false);
    assert!(servo.set_position(0.2).is_err());
    device.set_connected(true);
    servo.set_position(0.3).unwrap();

    assert_eq!(callback.requested.load(Ordering::SeqCst), 3);
    assert_eq!(callback.committed.load(Ordering::SeqCst), 2);
    assert_eq!(callback.transfers.load(Ordering::SeqCst), 2);
    assert_eq!(callback.failures.load(Ordering::SeqCst), 1);
    assert_eq!(callback.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(callback.reconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transfer_recorder() {
    let (controller, _device, _bus) = ready_controller("1");
    let (recorder, rx) = TransferRecorder::new();
    controller.add_callback(Arc::new(recorder));

    controller.get_servo(0).unwrap().set_position(1.0).unwrap();
    controller.get_servo(0).unwrap().set_position(0.0).unwrap();

    let records: Vec<_> = rx.try_iter().collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].sequence, 0);
    assert_eq!(records[0].data[0], 208);
    assert_eq!(records[1].data[0], 0xE8);
}

#[test]
fn test_servo_after_close() {
    let (controller, device, _bus) = ready_controller("1");
    let servo = controller.get_servo(0).unwrap();

    controller.close();
    assert!(matches!(
        servo.set_position(0.5),
        Err(DriverError::NotInitialized)
    ));
    assert!(matches!(
        controller.get_servo(0),
        Err(DriverError::NotInitialized)
    ));
    assert_eq!(device.open_handle_count(), 0);
}

#[test]
fn test_concurrent_channels_do_not_interleave() {
    let (controller, device, _bus) = ready_controller("1");
    let servos: Vec<_> = (0..4).map(|ch| controller.get_servo(ch).unwrap()).collect();

    std::thread::scope(|scope| {
        for servo in &servos {
            scope.spawn(move || {
                for step in 0..=20 {
                    servo.set_position(f64::from(step) / 20.0).unwrap();
                }
            });
        }
    });

    // 每个缓冲区都是某一时刻完整的脉宽数组
    for transfer in device.transfers() {
        let buffer: [u8; 6] = transfer.data.try_into().unwrap();
        for pulse in QuadServoProtocol::unpack(&buffer) {
            assert!(pulse == 0 || (1000..=2000).contains(&pulse));
        }
    }
    assert_eq!(last_pulses(&device), [2000, 2000, 2000, 2000]);
    assert_eq!(device.transfers().len(), 84);
}

/// 在回调里重新调用控制器和舵机
struct ReentrantCallback {
    controller: Weak<ServoController>,
    servo: Arc<Servo>,
    seen: Mutex<Vec<(Vec<u16>, f64)>>,
}

impl ControllerCallback for ReentrantCallback {
    fn on_transfer(&self, _buffer: &[u8]) {
        if let Some(controller) = self.controller.upgrade() {
            let raw = controller.raw_positions();
            self.seen.lock().unwrap().push((raw, self.servo.position()));
        }
    }

    fn on_actual_position(&self, _channel: usize, _position: f64) {
        let _ = self.servo.actual_position();
        let _ = self.servo.is_transitioning();
    }
}

#[test]
fn test_callbacks_may_reenter_controller() {
    let device = MockDevice::quad_servo("1");
    let controller = Arc::new(ServoController::new(MockBus::with_devices([device.clone()])));
    controller.init(None).unwrap();
    let servo = controller.get_servo(0).unwrap();

    let callback = Arc::new(ReentrantCallback {
        controller: Arc::downgrade(&controller),
        servo: servo.clone(),
        seen: Mutex::new(Vec::new()),
    });
    controller.add_callback(callback.clone());

    let (tx, rx) = std::sync::mpsc::channel();
    let worker = {
        let servo = servo.clone();
        std::thread::spawn(move || {
            servo.set_position(0.5).unwrap();
            servo.set_range(1000, 3000).unwrap();
            tx.send(()).unwrap();
        })
    };

    // 回调在锁内触发时这里会超时
    rx.recv_timeout(std::time::Duration::from_secs(5))
        .expect("callback deadlocked the controller");
    worker.join().unwrap();

    let seen = callback.seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[(vec![1500, 0, 0, 0], 0.5), (vec![2000, 0, 0, 0], 0.5)]);
}
