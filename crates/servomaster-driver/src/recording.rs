//! 传输录制钩子
//!
//! 把每个成功发送的命令缓冲区转发到有界通道，供后台线程消费（例如 CLI 打印、
//! 测试断言）。队列满时丢弃而不是阻塞，丢弃数量可监控。

use crate::hooks::ControllerCallback;
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// 默认队列容量
pub const DEFAULT_RECORDER_CAPACITY: usize = 1024;

/// 一次被录制的传输
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransfer {
    /// 序号（从 0 开始，包括被丢弃的）
    pub sequence: u64,

    /// 相对录制器创建时刻的时间（微秒）
    pub elapsed_us: u64,

    /// 命令缓冲区
    pub data: Vec<u8>,
}

/// 传输录制钩子
///
/// # 示例
///
/// ```rust
/// use servomaster_driver::recording::TransferRecorder;
/// use servomaster_driver::hooks::ControllerCallback;
/// use std::sync::Arc;
///
/// let (recorder, rx) = TransferRecorder::with_capacity(1);
/// let dropped = recorder.dropped_transfers().clone();
///
/// recorder.on_transfer(&[1, 2]);
/// recorder.on_transfer(&[3, 4]);
///
/// assert_eq!(rx.try_recv().unwrap().data, vec![1, 2]);
/// assert_eq!(dropped.load(std::sync::atomic::Ordering::Relaxed), 1);
/// ```
pub struct TransferRecorder {
    tx: Sender<RecordedTransfer>,
    started: Instant,
    dropped_transfers: Arc<AtomicU64>,
    transfer_counter: Arc<AtomicU64>,
}

impl TransferRecorder {
    /// 创建默认容量的录制钩子
    #[must_use]
    pub fn new() -> (Self, Receiver<RecordedTransfer>) {
        Self::with_capacity(DEFAULT_RECORDER_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Self, Receiver<RecordedTransfer>) {
        let (tx, rx) = bounded(capacity);
        let recorder = Self {
            tx,
            started: Instant::now(),
            dropped_transfers: Arc::new(AtomicU64::new(0)),
            transfer_counter: Arc::new(AtomicU64::new(0)),
        };
        (recorder, rx)
    }

    /// 队列满而被丢弃的传输数
    #[must_use]
    pub fn dropped_transfers(&self) -> &Arc<AtomicU64> {
        &self.dropped_transfers
    }

    /// 观察到的传输总数
    #[must_use]
    pub fn transfer_counter(&self) -> &Arc<AtomicU64> {
        &self.transfer_counter
    }
}

impl ControllerCallback for TransferRecorder {
    fn on_transfer(&self, buffer: &[u8]) {
        let sequence = self.transfer_counter.fetch_add(1, Ordering::Relaxed);
        let record = RecordedTransfer {
            sequence,
            elapsed_us: self.started.elapsed().as_micros() as u64,
            data: buffer.to_vec(),
        };

        if self.tx.try_send(record).is_err() {
            self.dropped_transfers.fetch_add(1, Ordering::Relaxed);
        }
    }
}
