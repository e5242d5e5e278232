//! 爬行过渡：固定步长、固定间隔逼近目标

use super::{TransitionController, TransitionToken};
use crate::config::TransitionConfig;
use crate::servo::Servo;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 间隔末尾改用自旋休眠的长度
const SPIN_TAIL: Duration = Duration::from_millis(2);

/// 爬行过渡控制器
///
/// 步长默认由舵机精度推导：`1 / (precision - 1)`，即每步移动一个脉宽单位。
/// 距离目标不超过半步时结束，最后一次总是写入精确的目标值。
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlTransitionController {
    step: Option<f64>,
    interval: Duration,
}

impl Default for CrawlTransitionController {
    fn default() -> Self {
        Self::from_config(&TransitionConfig::default())
    }
}

impl CrawlTransitionController {
    pub fn new(step: Option<f64>, interval: Duration) -> Self {
        Self { step, interval }
    }

    pub fn from_config(config: &TransitionConfig) -> Self {
        Self::new(config.step, config.interval())
    }

    /// 本次过渡使用的步长
    fn step_for(&self, servo: &Servo) -> Option<f64> {
        if let Some(step) = self.step {
            return Some(step);
        }

        let precision = servo.precision();
        if precision <= 1 {
            warn!(
                "Servo {}: expected precision > 1, got {}",
                servo.name(),
                precision
            );
            return None;
        }
        Some(1.0 / f64::from(precision - 1))
    }

    /// 等待一个步间隔，令牌停止时立即返回 false
    ///
    /// 间隔主体在令牌上等待，末尾 `SPIN_TAIL` 用 `spin_sleep` 补足精度。
    fn pace(&self, token: &TransitionToken) -> bool {
        let deadline = Instant::now() + self.interval;
        if token.wait_stopped(self.interval.saturating_sub(SPIN_TAIL)) {
            return false;
        }
        spin_sleep::sleep(deadline.saturating_duration_since(Instant::now()));
        !token.is_stopped()
    }
}

impl TransitionController for CrawlTransitionController {
    fn transition(&self, servo: &Servo, token: &TransitionToken, target_position: f64) {
        let Some(step) = self.step_for(servo) else {
            let _ = token.supply(target_position);
            return;
        };

        let mut position = servo.actual_position();
        debug!(
            "Servo {}: crawl {:.4} => {:.4}, step {:.6}",
            servo.name(),
            position,
            target_position,
            step
        );

        while (target_position - position).abs() > step / 2.0 {
            position = if position > target_position {
                (position - step).max(target_position)
            } else {
                (position + step).min(target_position)
            };

            if token.supply(position).is_err() || !self.pace(token) {
                return;
            }
        }

        let _ = token.supply(target_position);
    }
}
