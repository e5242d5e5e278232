//! 过渡驱动器
//!
//! 一个驱动器绑定一个舵机和一个目标位置，启动两个线程：
//!
//! - 生产者：运行 `TransitionController::transition()`，结束后关闭令牌
//! - 消费者：从令牌取值并调用 `Servo::set_actual_position()` 提交
//!
//! `stop()` 停止令牌并等待消费者退出，返回后不会再有旧过渡的提交。
//! 生产者不被等待，它在令牌停止后的下一次 `supply()` 或 `wait_stopped()` 时退出。

use super::{Consumed, TransitionController, TransitionToken};
use crate::error::DriverError;
use crate::servo::Servo;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{trace, warn};

/// 消费者等待新值的轮询间隔
const CONSUME_POLL: Duration = Duration::from_millis(50);

/// 过渡完成通知
#[derive(Debug, Clone, Default)]
pub(crate) struct Completion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Completion {
    fn complete(&self) {
        let (done, changed) = &*self.inner;
        *done.lock() = true;
        changed.notify_all();
    }

    pub(crate) fn is_complete(&self) -> bool {
        *self.inner.0.lock()
    }

    /// 等待完成，超时返回 false
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let (done, changed) = &*self.inner;
        let mut done = done.lock();
        if !*done {
            let _ = changed.wait_while_for(&mut done, |done| !*done, timeout);
        }
        *done
    }
}

/// 过渡驱动器
pub struct TransitionDriver {
    target_position: f64,
    token: Arc<TransitionToken>,
    completion: Completion,
    consumer: Option<JoinHandle<()>>,
}

impl TransitionDriver {
    /// 启动过渡
    pub fn start(
        servo: Arc<Servo>,
        controller: Arc<dyn TransitionController>,
        target_position: f64,
    ) -> Result<Self, DriverError> {
        let token = Arc::new(TransitionToken::new());
        let completion = Completion::default();
        let name = servo.name();

        // 生产者不被等待：令牌停止后它在下一次 supply() 或 wait_stopped() 时自行退出
        {
            let servo = servo.clone();
            let token = token.clone();
            thread::Builder::new()
                .name(format!("transition-{}", name))
                .spawn(move || {
                    controller.transition(&servo, &token, target_position);
                    token.close();
                })
                .map_err(|e| DriverError::Thread(e.to_string()))?;
        }

        let spawned = {
            let token = token.clone();
            let completion = completion.clone();
            thread::Builder::new()
                .name(format!("transition-{}-commit", name))
                .spawn(move || {
                    Self::consume_loop(&servo, &token);
                    token.stop();
                    completion.complete();
                    trace!("Servo {}: transition to {:.4} finished", servo.name(), target_position);
                })
        };
        let consumer = spawned.map_err(|e| Self::abort_start(&token, e))?;

        Ok(Self {
            target_position,
            token,
            completion,
            consumer: Some(consumer),
        })
    }

    /// 提交线程启动失败：停止令牌，让已启动的生产者退出
    fn abort_start(token: &TransitionToken, error: std::io::Error) -> DriverError {
        token.stop();
        DriverError::Thread(error.to_string())
    }

    fn consume_loop(servo: &Servo, token: &TransitionToken) {
        loop {
            match token.consume_timeout(CONSUME_POLL) {
                Consumed::Position(position) => {
                    if let Err(e) = servo.set_actual_position(position) {
                        warn!("Servo {}: transition step failed: {}", servo.name(), e);
                        return;
                    }
                },
                Consumed::Empty => {},
                Consumed::Done => return,
            }
        }
    }

    pub fn target_position(&self) -> f64 {
        self.target_position
    }

    /// 过渡是否已结束（到达、失败或被停止）
    pub fn is_finished(&self) -> bool {
        self.completion.is_complete()
    }

    pub(crate) fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// 停止过渡并等待提交线程退出
    ///
    /// 不保证到达目标位置。
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.stop();
        if let Some(consumer) = self.consumer.take() {
            // 消费者线程持有舵机，可能由它释放最后一个引用
            if consumer.thread().id() != thread::current().id() {
                let _ = consumer.join();
            }
        }
    }
}

impl Drop for TransitionDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TransitionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionDriver")
            .field("target_position", &self.target_position)
            .field("finished", &self.is_finished())
            .finish()
    }
}
