//! 控制器指标
//!
//! 原子计数器，由宿主通过 `Arc` 注入或读取，不在对象构造/析构时维护任何全局状态。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 控制器实时指标
///
/// # 使用示例
///
/// ```rust
/// use servomaster_driver::ControllerMetrics;
/// use std::sync::Arc;
/// use std::sync::atomic::Ordering;
///
/// let metrics = Arc::new(ControllerMetrics::default());
/// metrics.transfers_total.fetch_add(1, Ordering::Relaxed);
///
/// let snapshot = metrics.snapshot();
/// assert_eq!(snapshot.transfers_total, 1);
/// ```
#[derive(Debug, Default)]
pub struct ControllerMetrics {
    /// 成功的输出传输次数
    pub transfers_total: AtomicU64,

    /// 失败的输出传输次数
    pub transfer_errors: AtomicU64,

    /// 断开后重新发现设备的次数
    pub rediscoveries: AtomicU64,

    /// 创建的硬件舵机数量
    pub servos_created: AtomicU64,

    /// 成功提交的实际位置次数
    pub positions_committed: AtomicU64,

    pub transitions_started: AtomicU64,

    /// 未完成即被新请求或关闭打断的过渡
    pub transitions_cancelled: AtomicU64,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指标快照
    ///
    /// 各计数器分别读取，之间可能有微小的时间差。
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfer_errors: self.transfer_errors.load(Ordering::Relaxed),
            rediscoveries: self.rediscoveries.load(Ordering::Relaxed),
            servos_created: self.servos_created.load(Ordering::Relaxed),
            positions_committed: self.positions_committed.load(Ordering::Relaxed),
            transitions_started: self.transitions_started.load(Ordering::Relaxed),
            transitions_cancelled: self.transitions_cancelled.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        self.transfers_total.store(0, Ordering::Relaxed);
        self.transfer_errors.store(0, Ordering::Relaxed);
        self.rediscoveries.store(0, Ordering::Relaxed);
        self.servos_created.store(0, Ordering::Relaxed);
        self.positions_committed.store(0, Ordering::Relaxed);
        self.transitions_started.store(0, Ordering::Relaxed);
        self.transitions_cancelled.store(0, Ordering::Relaxed);
    }

    pub(crate) fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub transfers_total: u64,
    pub transfer_errors: u64,
    pub rediscoveries: u64,
    pub servos_created: u64,
    pub positions_committed: u64,
    pub transitions_started: u64,
    pub transitions_cancelled: u64,
}

impl MetricsSnapshot {
    /// 传输失败率（0.0 ~ 1.0），没有任何传输时为 0
    pub fn transfer_error_rate(&self) -> f64 {
        let attempts = self.transfers_total + self.transfer_errors;
        if attempts == 0 {
            return 0.0;
        }
        self.transfer_errors as f64 / attempts as f64
    }
}
