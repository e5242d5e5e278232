//! 舵机
//!
//! 两类舵机共用同一个类型：
//!
//! - 硬件舵机：由 [`ServoController::get_servo`](crate::ServoController::get_servo) 创建，
//!   把 0.0 ~ 1.0 的位置线性映射为脉宽并写入控制器
//! - 变换舵机：由 [`Servo::reversed`]、[`Servo::linear`]、[`Servo::scaled`] 等创建，
//!   把位置变换后委托给目标舵机
//!
//! # 锁顺序
//!
//! 舵机状态锁可以在持有时获取控制器锁，反之不行。过渡驱动器的停止与等待
//! 一律在不持有任何锁时进行。
//! 提交产生的钩子事件在释放舵机锁之后才分发。

use crate::controller::ControllerShared;
use crate::error::DriverError;
use crate::hooks::HookEvent;
use crate::metrics::ControllerMetrics;
use crate::transform::CoordinateTransform;
use crate::transition::{TransitionController, TransitionDriver};
use parking_lot::Mutex;
use servomaster_protocol::MAX_PULSE_VALUE;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// 委托链深度上限
const MAX_CHAIN_DEPTH: usize = 64;

enum ServoKind {
    Hardware {
        controller: Weak<ControllerShared>,
        channel: usize,
    },
    Transform {
        target: Arc<Servo>,
        transform: CoordinateTransform,
    },
}

struct ServoState {
    /// 最后一次 `set_position` 的值
    position: f64,
    /// 最后一次实际提交的值
    actual_position: f64,
    enabled: bool,
    min_pulse: u16,
    max_pulse: u16,
    /// 是否提交过位置（调整脉宽范围时需要重新提交）
    committed: bool,
    transition_controller: Option<Arc<dyn TransitionController>>,
    driver: Option<TransitionDriver>,
}

impl ServoState {
    fn new(actual_position: f64, min_pulse: u16, max_pulse: u16) -> Self {
        Self {
            position: actual_position,
            actual_position,
            enabled: true,
            min_pulse,
            max_pulse,
            committed: false,
            transition_controller: None,
            driver: None,
        }
    }
}

/// 舵机
pub struct Servo {
    kind: ServoKind,
    state: Mutex<ServoState>,
    /// 叠加在本舵机之上的变换舵机
    dependents: Mutex<Vec<Weak<Servo>>>,
}

/// 位置必须在 `[0.0, 1.0]` 内（NaN 同样拒绝）
fn check_position(position: f64) -> Result<(), DriverError> {
    if !(0.0..=1.0).contains(&position) {
        return Err(DriverError::PositionOutOfRange(position));
    }
    Ok(())
}

/// `pulse = min + p * (max - min)`，向零截断到整数微秒
pub fn pulse_for(position: f64, min_pulse: u16, max_pulse: u16) -> u16 {
    let span = f64::from(max_pulse - min_pulse);
    (f64::from(min_pulse) + position * span) as u16
}

impl Servo {
    pub(crate) fn hardware(
        controller: Weak<ControllerShared>,
        channel: usize,
        min_pulse: u16,
        max_pulse: u16,
    ) -> Self {
        Self {
            kind: ServoKind::Hardware {
                controller,
                channel,
            },
            state: Mutex::new(ServoState::new(0.0, min_pulse, max_pulse)),
            dependents: Mutex::new(Vec::new()),
        }
    }

    /// 不属于任何控制器的硬件舵机（提交会失败）
    #[cfg(test)]
    pub(crate) fn detached(actual_position: f64, min_pulse: u16, max_pulse: u16) -> Self {
        let servo = Self::hardware(Weak::new(), 0, min_pulse, max_pulse);
        servo.state.lock().actual_position = actual_position;
        servo
    }

    /// 反向变换舵机：`p -> 1 - p`
    pub fn reversed(target: &Arc<Servo>) -> Arc<Servo> {
        Self::with_transform(target, CoordinateTransform::Reverse)
    }

    /// 曲柄线性化变换舵机
    ///
    /// # 错误
    /// - `DriverError::InvalidAngles`: 不满足 `0 <= start < end <= 180`
    pub fn linear(target: &Arc<Servo>, start: f64, end: f64) -> Result<Arc<Servo>, DriverError> {
        Ok(Self::with_transform(
            target,
            CoordinateTransform::linear(start, end)?,
        ))
    }

    /// 缩放平移变换舵机：`p -> p * scale + shift`
    ///
    /// # 错误
    /// - `DriverError::InvalidScale`: `scale` 为零或参数不是有限值
    pub fn scaled(target: &Arc<Servo>, scale: f64, shift: f64) -> Result<Arc<Servo>, DriverError> {
        Ok(Self::with_transform(
            target,
            CoordinateTransform::scale(scale, shift)?,
        ))
    }

    /// 正弦变换舵机：`p -> sin p`
    pub fn sine(target: &Arc<Servo>) -> Arc<Servo> {
        Self::with_transform(target, CoordinateTransform::Sine)
    }

    /// 余弦变换舵机：`p -> cos p`
    pub fn cosine(target: &Arc<Servo>) -> Arc<Servo> {
        Self::with_transform(target, CoordinateTransform::Cosine)
    }

    /// 以任意变换叠加在 `target` 之上
    pub fn with_transform(target: &Arc<Servo>, transform: CoordinateTransform) -> Arc<Servo> {
        let (min_pulse, max_pulse) = target.range();
        let actual_position = transform.resolve(target.actual_position());

        let servo = Arc::new(Servo {
            kind: ServoKind::Transform {
                target: target.clone(),
                transform,
            },
            state: Mutex::new(ServoState::new(actual_position, min_pulse, max_pulse)),
            dependents: Mutex::new(Vec::new()),
        });

        target.dependents.lock().push(Arc::downgrade(&servo));
        servo
    }

    /// 舵机名称：硬件舵机为通道号，变换舵机形如 `reversed(0)`
    pub fn name(&self) -> String {
        match &self.kind {
            ServoKind::Hardware { channel, .. } => channel.to_string(),
            ServoKind::Transform { target, transform } => {
                format!("{}({})", transform.name(), target.name())
            },
        }
    }

    /// 最终驱动的硬件通道
    pub fn channel(&self) -> usize {
        match &self.kind {
            ServoKind::Hardware { channel, .. } => *channel,
            ServoKind::Transform { target, .. } => target.channel(),
        }
    }

    /// 委托目标（硬件舵机没有）
    pub fn target(&self) -> Option<&Arc<Servo>> {
        match &self.kind {
            ServoKind::Hardware { .. } => None,
            ServoKind::Transform { target, .. } => Some(target),
        }
    }

    pub fn transform(&self) -> Option<CoordinateTransform> {
        match &self.kind {
            ServoKind::Hardware { .. } => None,
            ServoKind::Transform { transform, .. } => Some(*transform),
        }
    }

    pub fn transition_controller(&self) -> Option<Arc<dyn TransitionController>> {
        self.state.lock().transition_controller.clone()
    }

    /// 最后一次请求的位置
    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    /// 最后一次实际提交的位置
    pub fn actual_position(&self) -> f64 {
        self.state.lock().actual_position
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// 禁用后 `set_position` 返回 `ServoDisabled`
    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
        debug!("Servo {}: enabled = {}", self.name(), enabled);
    }

    /// 脉宽范围 `(min, max)`
    pub fn range(&self) -> (u16, u16) {
        match &self.kind {
            ServoKind::Hardware { .. } => {
                let state = self.state.lock();
                (state.min_pulse, state.max_pulse)
            },
            ServoKind::Transform { target, .. } => target.range(),
        }
    }

    /// 可分辨的位置数：`max - min`
    pub fn precision(&self) -> u16 {
        let (min, max) = self.range();
        max - min
    }

    /// 调整脉宽范围
    ///
    /// 如果舵机已提交过位置，用新范围重新提交当前实际位置。
    /// 变换舵机的范围就是目标舵机的范围。
    ///
    /// # 错误
    /// - `DriverError::InvalidRange`: 不满足 `min < max <= 4095`
    pub fn set_range(&self, min_pulse: u16, max_pulse: u16) -> Result<(), DriverError> {
        if min_pulse >= max_pulse || max_pulse > MAX_PULSE_VALUE {
            return Err(DriverError::InvalidRange {
                min: min_pulse,
                max: max_pulse,
            });
        }

        match &self.kind {
            ServoKind::Transform { target, .. } => target.set_range(min_pulse, max_pulse),
            ServoKind::Hardware {
                controller,
                channel,
            } => {
                let mut events = Vec::new();
                let result = {
                    let mut state = self.state.lock();
                    state.min_pulse = min_pulse;
                    state.max_pulse = max_pulse;
                    debug!("Servo {}: range {}..{} us", channel, min_pulse, max_pulse);

                    if state.committed {
                        let position = state.actual_position;
                        Self::commit(controller, *channel, &mut state, position, &mut events)
                    } else {
                        Ok(())
                    }
                };
                self.fire(events);
                result
            },
        }
    }

    /// 请求移动到 `position`
    ///
    /// 先校验范围与启用状态，然后记录请求位置。挂有过渡控制器时启动过渡并立即返回，
    /// 否则同步提交。正在进行的过渡总是先被停止。
    pub fn set_position(self: &Arc<Self>, position: f64) -> Result<(), DriverError> {
        check_position(position)?;

        let (controller, stale) = {
            let mut state = self.state.lock();
            if !state.enabled {
                return Err(DriverError::ServoDisabled {
                    channel: self.channel(),
                });
            }
            state.position = position;
            (state.transition_controller.clone(), state.driver.take())
        };

        self.notify_requested(position);

        if let Some(driver) = stale {
            self.cancel(driver);
        }

        let Some(controller) = controller else {
            return self.set_actual_position(position);
        };

        let driver = TransitionDriver::start(self.clone(), controller, position)?;
        self.count(|metrics| &metrics.transitions_started);

        // 并发的 set_position 可能已经放入了另一个驱动器
        let displaced = self.state.lock().driver.replace(driver);
        if let Some(driver) = displaced {
            self.cancel(driver);
        }
        Ok(())
    }

    /// 立即提交位置（过渡驱动器的每一步也走这里）
    pub fn set_actual_position(&self, position: f64) -> Result<(), DriverError> {
        check_position(position)?;

        match &self.kind {
            ServoKind::Hardware {
                controller,
                channel,
            } => {
                let mut events = Vec::new();
                let result = {
                    let mut state = self.state.lock();
                    Self::commit(controller, *channel, &mut state, position, &mut events)
                };
                // 钩子在释放舵机锁之后触发
                self.fire(events);
                result
            },
            ServoKind::Transform { target, transform } => {
                target.set_position(transform.apply(position))?;
                self.state.lock().actual_position = position;
                Ok(())
            },
        }
    }

    fn commit(
        controller: &Weak<ControllerShared>,
        channel: usize,
        state: &mut ServoState,
        position: f64,
        events: &mut Vec<HookEvent>,
    ) -> Result<(), DriverError> {
        let shared = controller.upgrade().ok_or(DriverError::ControllerGone)?;
        let pulse = pulse_for(position, state.min_pulse, state.max_pulse);
        debug!("Servo {}: {:.4} -> {} us", channel, position, pulse);

        shared.commit(channel, pulse, position, events)?;
        state.actual_position = position;
        state.committed = true;
        Ok(())
    }

    /// 挂载过渡控制器，返回原来的控制器
    ///
    /// 整条委托链（目标方向与叠加方向）上最多只能有一个过渡控制器；
    /// 本舵机自己原有的控制器会被替换。
    ///
    /// # 错误
    /// - `DriverError::TransitionStackConflict`: 链上其他舵机已挂有过渡控制器
    pub fn attach(
        &self,
        controller: Arc<dyn TransitionController>,
    ) -> Result<Option<Arc<dyn TransitionController>>, DriverError> {
        let mut depth = 0;
        let mut node = self.target();
        while let Some(servo) = node {
            depth += 1;
            if depth > MAX_CHAIN_DEPTH || servo.transition_controller().is_some() {
                return Err(DriverError::TransitionStackConflict);
            }
            node = servo.target();
        }

        if self.dependents_have_controller(0) {
            return Err(DriverError::TransitionStackConflict);
        }

        let previous = self.state.lock().transition_controller.replace(controller);
        debug!("Servo {}: transition controller attached", self.name());
        Ok(previous)
    }

    /// 卸下过渡控制器（正在进行的过渡继续完成）
    pub fn detach(&self) -> Option<Arc<dyn TransitionController>> {
        self.state.lock().transition_controller.take()
    }

    fn dependents_have_controller(&self, depth: usize) -> bool {
        if depth > MAX_CHAIN_DEPTH {
            return true;
        }

        let dependents: Vec<Arc<Servo>> = {
            let mut dependents = self.dependents.lock();
            dependents.retain(|dependent| dependent.strong_count() > 0);
            dependents.iter().filter_map(Weak::upgrade).collect()
        };

        dependents.iter().any(|dependent| {
            dependent.transition_controller().is_some()
                || dependent.dependents_have_controller(depth + 1)
        })
    }

    /// 是否有未结束的过渡
    pub fn is_transitioning(&self) -> bool {
        self.state
            .lock()
            .driver
            .as_ref()
            .is_some_and(|driver| !driver.is_finished())
    }

    /// 等待当前过渡结束，超时返回 false；没有过渡时立即返回 true
    pub fn wait_for_transition(&self, timeout: Duration) -> bool {
        let completion = self
            .state
            .lock()
            .driver
            .as_ref()
            .map(TransitionDriver::completion);

        match completion {
            Some(completion) => completion.wait_timeout(timeout),
            None => true,
        }
    }

    /// 停止当前过渡，返回是否打断了一个未结束的过渡
    pub fn stop_transition(&self) -> bool {
        let driver = self.state.lock().driver.take();
        match driver {
            Some(driver) => self.cancel(driver),
            None => false,
        }
    }

    fn cancel(&self, driver: TransitionDriver) -> bool {
        let running = !driver.is_finished();
        let target_position = driver.target_position();
        driver.stop();

        if running {
            self.count(|metrics| &metrics.transitions_cancelled);
            debug!(
                "Servo {}: transition to {:.4} cancelled",
                self.name(),
                target_position
            );
        }
        running
    }

    fn shared(&self) -> Option<Arc<ControllerShared>> {
        match &self.kind {
            ServoKind::Hardware { controller, .. } => controller.upgrade(),
            ServoKind::Transform { target, .. } => target.shared(),
        }
    }

    fn fire(&self, events: Vec<HookEvent>) {
        if !events.is_empty()
            && let Some(shared) = self.shared()
        {
            shared.fire(events);
        }
    }

    fn count(&self, counter: impl FnOnce(&ControllerMetrics) -> &AtomicU64) {
        if let Some(shared) = self.shared() {
            ControllerMetrics::increment(counter(&shared.metrics));
        }
    }

    fn notify_requested(&self, position: f64) {
        if let ServoKind::Hardware {
            controller,
            channel,
        } = &self.kind
            && let Some(shared) = controller.upgrade()
        {
            shared.hooks().trigger_position_requested(*channel, position);
        }
    }
}

impl fmt::Debug for Servo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Servo")
            .field("name", &self.name())
            .field("position", &state.position)
            .field("actual_position", &state.actual_position)
            .field("enabled", &state.enabled)
            .field("transition", &state.transition_controller.is_some())
            .finish()
    }
}
