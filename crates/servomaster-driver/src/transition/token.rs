//! 过渡令牌
//!
//! 过渡控制器（生产者）与过渡驱动器（消费者）之间的单槽信箱：
//!
//! - `supply()` 覆盖写入，未被消费的旧值直接丢弃
//! - `consume()` 取出并清空
//! - `stop()` 终止：丢弃未消费的值，此后 `consume()` 只返回 `Done`，
//!   `supply()` 返回错误，生产者据此尽快退出
//! - `close()` 由生产者正常结束时调用：已写入的最后一个值仍可被取出

use crate::error::DriverError;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// `consume` 的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Consumed {
    /// 取到一个待提交的位置
    Position(f64),
    /// 暂无新值
    Empty,
    /// 已停止，或生产者已结束且没有剩余值
    Done,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<f64>,
    closed: bool,
    stopped: bool,
}

/// 过渡令牌
#[derive(Debug, Default)]
pub struct TransitionToken {
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl TransitionToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入下一个位置（覆盖未消费的值）
    ///
    /// # 错误
    /// - `DriverError::TransitionCancelled`: 令牌已停止或已关闭
    pub fn supply(&self, position: f64) -> Result<(), DriverError> {
        let mut slot = self.slot.lock();
        if slot.stopped || slot.closed {
            return Err(DriverError::TransitionCancelled);
        }
        slot.pending = Some(position);
        self.changed.notify_all();
        Ok(())
    }

    /// 非阻塞取值
    pub fn consume(&self) -> Consumed {
        let mut slot = self.slot.lock();
        Self::take(&mut slot)
    }

    /// 等待新值、停止或关闭，最多等待 `timeout`
    pub fn consume_timeout(&self, timeout: Duration) -> Consumed {
        let mut slot = self.slot.lock();
        if slot.pending.is_none() && !slot.stopped && !slot.closed {
            let _ = self.changed.wait_for(&mut slot, timeout);
        }
        Self::take(&mut slot)
    }

    fn take(slot: &mut Slot) -> Consumed {
        if slot.stopped {
            return Consumed::Done;
        }
        match slot.pending.take() {
            Some(position) => Consumed::Position(position),
            None if slot.closed => Consumed::Done,
            None => Consumed::Empty,
        }
    }

    /// 强制终止
    pub fn stop(&self) {
        let mut slot = self.slot.lock();
        slot.stopped = true;
        slot.pending = None;
        self.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.slot.lock().stopped
    }

    /// 等待令牌停止，最多等待 `timeout`
    ///
    /// 返回令牌是否已停止。生产者在步与步之间用它代替休眠，停止后立即醒来。
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let mut slot = self.slot.lock();
        if !slot.stopped {
            let _ = self
                .changed
                .wait_while_for(&mut slot, |slot| !slot.stopped, timeout);
        }
        slot.stopped
    }

    /// 生产者结束，不再写入
    pub(crate) fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        self.changed.notify_all();
    }
}
