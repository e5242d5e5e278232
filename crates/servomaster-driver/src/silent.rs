//! 静默管理
//!
//! 控制器空闲超过 `timeout` 后发送静默缓冲区，所有舵机停止出力；下一次提交
//! 自动唤醒。`heartbeat` 大于零时，静默持续 `heartbeat` 后重新发送一次当前位置，
//! 然后重新开始计时；为零时一直静默到下一次提交。
//!
//! 计时与状态在本模块，实际的发送由控制器的后台线程完成：
//! [`Silencer::next_action`] 阻塞到下一个到期的动作，控制器加锁后用
//! [`Silencer::confirm`] 再确认一次，避免与并发的提交竞争。
//!
//! 锁顺序：控制器锁 -> 静默状态锁。

use crate::config::SilentConfig;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// 到期的静默动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SilentAction {
    /// 发送静默缓冲区
    Sleep,
    /// 心跳：重新发送当前位置
    WakeUp,
}

enum Due {
    Now(SilentAction),
    At(Instant),
    Never,
}

#[derive(Debug)]
struct SilencerState {
    enabled: bool,
    timeout: Duration,
    heartbeat: Duration,
    last_activity: Instant,
    silent: bool,
    shutdown: bool,
}

impl SilencerState {
    fn due(&self, now: Instant) -> Due {
        if !self.enabled {
            return Due::Never;
        }

        let (deadline, action) = if !self.silent {
            (self.last_activity + self.timeout, SilentAction::Sleep)
        } else if self.heartbeat.is_zero() {
            return Due::Never;
        } else {
            (
                self.last_activity + self.timeout + self.heartbeat,
                SilentAction::WakeUp,
            )
        };

        if now >= deadline {
            Due::Now(action)
        } else {
            Due::At(deadline)
        }
    }
}

/// 静默计时器
#[derive(Debug)]
pub(crate) struct Silencer {
    state: Mutex<SilencerState>,
    changed: Condvar,
}

impl Silencer {
    pub(crate) fn new(config: &SilentConfig) -> Self {
        Self {
            state: Mutex::new(SilencerState {
                enabled: false,
                timeout: config.timeout(),
                heartbeat: config.heartbeat(),
                last_activity: Instant::now(),
                silent: false,
                shutdown: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// 记录一次操作；原来处于静默状态时返回 true
    pub(crate) fn touch(&self) -> bool {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        let was_silent = std::mem::replace(&mut state.silent, false);
        self.changed.notify_all();
        was_silent
    }

    /// 开关自动静默；关闭时原来处于静默状态则返回 true
    pub(crate) fn set_enabled(&self, enabled: bool) -> bool {
        let mut state = self.state.lock();
        state.enabled = enabled;
        state.last_activity = Instant::now();
        let was_silent = !enabled && std::mem::replace(&mut state.silent, false);
        self.changed.notify_all();
        was_silent
    }

    pub(crate) fn set_timeout(&self, timeout: Duration, heartbeat: Duration) {
        let mut state = self.state.lock();
        state.timeout = timeout;
        state.heartbeat = heartbeat;
        self.changed.notify_all();
    }

    pub(crate) fn timeout(&self) -> (Duration, Duration) {
        let state = self.state.lock();
        (state.timeout, state.heartbeat)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub(crate) fn is_silent(&self) -> bool {
        self.state.lock().silent
    }

    /// 手动静默后同步状态；原来不在静默状态时返回 true
    pub(crate) fn mark_silent(&self) -> bool {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        let was_awake = !std::mem::replace(&mut state.silent, true);
        self.changed.notify_all();
        was_awake
    }

    /// 让 `next_action` 返回 `None`
    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.changed.notify_all();
    }

    /// 阻塞到下一个到期的动作，关闭后返回 `None`
    pub(crate) fn next_action(&self) -> Option<SilentAction> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            match state.due(Instant::now()) {
                Due::Now(action) => return Some(action),
                Due::At(deadline) => {
                    let _ = self.changed.wait_until(&mut state, deadline);
                },
                Due::Never => self.changed.wait(&mut state),
            }
        }
    }

    /// 确认 `action` 仍然到期并更新状态
    ///
    /// 返回 false 时不应执行该动作（期间发生了提交、关闭或配置变化）。
    pub(crate) fn confirm(&self, action: SilentAction) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state.shutdown || !matches!(state.due(now), Due::Now(due) if due == action) {
            return false;
        }

        match action {
            SilentAction::Sleep => state.silent = true,
            SilentAction::WakeUp => {
                state.silent = false;
                state.last_activity = now;
            },
        }
        true
    }
}
