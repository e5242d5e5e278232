//! 驱动层模块
//!
//! 本模块提供 USB 多通道舵机控制板的驱动功能，包括：
//! - 控制器：设备发现、脉宽数组、命令缓冲区发送、断开后重新发现
//! - 舵机：归一化位置（0.0 ~ 1.0）到脉宽的映射，反向/曲柄线性化变换
//! - 过渡管线：把一次位置请求拆成可打断的多步运动
//! - 自动静默：空闲超时后停止出力，心跳定期恢复
//! - 钩子系统：传输录制、自定义回调
//!
//! # 使用示例
//!
//! ```no_run
//! use servomaster_driver::{CrawlTransitionController, Servo, ServoController};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let controller = ServoController::builder().build()?;
//! controller.init(None)?;
//!
//! let servo = controller.get_servo(0)?;
//! servo.set_position(1.0)?;
//!
//! // 反向安装的舵机，缓慢移动
//! let reversed = Servo::reversed(&controller.get_servo(1)?);
//! reversed.attach(Arc::new(CrawlTransitionController::default()))?;
//! reversed.set_position(0.25)?;
//! reversed.wait_for_transition(Duration::from_secs(5));
//! # Ok::<(), servomaster_driver::DriverError>(())
//! ```

mod builder;
pub mod config;
mod controller;
mod error;
pub mod hooks;
pub mod metrics;
pub mod recording;
pub mod servo;
mod silent;
pub mod transform;
pub mod transition;

pub use builder::ServoControllerBuilder;
pub use config::{ControllerConfig, SilentConfig, TransitionConfig};
pub use controller::{ControllerMeta, ControllerStatus, ServoController};
pub use error::DriverError;
pub use hooks::{ControllerCallback, HookEvent, HookManager};
pub use metrics::{ControllerMetrics, MetricsSnapshot};
pub use recording::{RecordedTransfer, TransferRecorder};
pub use servo::{Servo, pulse_for};
pub use transform::CoordinateTransform;
pub use transition::{
    Consumed, CrawlTransitionController, TransitionController, TransitionDriver, TransitionToken,
};
