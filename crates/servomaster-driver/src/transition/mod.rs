//! 过渡管线
//!
//! 把一次"跳到某位置"的请求变成一段可打断的多步运动：
//!
//! - [`TransitionController`]：决定中间位置与节奏，写入令牌
//! - [`TransitionToken`]：单槽信箱
//! - [`TransitionDriver`]：后台取出中间位置并逐个提交到舵机
//!
//! 每个舵机同时最多一个活动的驱动器；新的位置请求会先停止旧的（后写者胜出，不排队）。

mod crawl;
mod driver;
mod token;

pub use crawl::CrawlTransitionController;
pub use driver::TransitionDriver;
pub use token::{Consumed, TransitionToken};

use crate::servo::Servo;
use std::fmt;

/// 过渡控制器 Trait
///
/// 每次过渡调用一次 `transition()`（在独立线程中）。实现应当反复调用
/// `token.supply()` 写入中间位置，直到到达 `target_position`，然后返回。
/// `supply()` 返回错误表示过渡已被取消，实现应立即返回。
///
/// `servo` 只用于读取当前实际位置与精度，中间位置一律通过令牌交付。
pub trait TransitionController: Send + Sync + fmt::Debug {
    fn transition(&self, servo: &Servo, token: &TransitionToken, target_position: f64);
}
