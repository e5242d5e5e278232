//! 坐标变换
//!
//! 变换舵机不直接驱动硬件，而是把请求的位置变换后交给目标舵机。
//! 变换舵机可以层层叠加，构成一条单向委托链。

use crate::error::DriverError;

/// 坐标变换
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoordinateTransform {
    /// 反向：`p -> 1 - p`
    Reverse,

    /// 曲柄线性化
    ///
    /// 舵机臂转角 θ 驱动的连杆位移与 `(1 - cos θ) / 2` 成正比。
    /// 本变换把线性位移请求换算回舵机位置，使输出端匀速。
    /// `start`/`end` 为舵机臂实际使用的角度范围（度）。
    Linear { start: f64, end: f64 },

    /// 缩放平移：`p -> p * scale + shift`
    Scale { scale: f64, shift: f64 },

    /// `p -> sin p`
    Sine,

    /// `p -> cos p`
    Cosine,
}

impl CoordinateTransform {
    /// 完整 0° ~ 180° 行程的线性化
    pub const FULL_LINEAR: Self = Self::Linear {
        start: 0.0,
        end: 180.0,
    };

    /// 指定角度范围的线性化，要求 `0 <= start < end <= 180`
    pub fn linear(start: f64, end: f64) -> Result<Self, DriverError> {
        if !(0.0..180.0).contains(&start) || !(start < end && end <= 180.0) {
            return Err(DriverError::InvalidAngles { start, end });
        }
        Ok(Self::Linear { start, end })
    }

    /// 缩放平移，`scale` 不能为零
    pub fn scale(scale: f64, shift: f64) -> Result<Self, DriverError> {
        if scale == 0.0 || !scale.is_finite() || !shift.is_finite() {
            return Err(DriverError::InvalidScale { scale, shift });
        }
        Ok(Self::Scale { scale, shift })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Reverse => "reversed",
            Self::Linear { .. } => "linear",
            Self::Scale { .. } => "scaled",
            Self::Sine => "sine",
            Self::Cosine => "cosine",
        }
    }

    /// 请求位置 -> 目标舵机位置
    pub fn apply(&self, position: f64) -> f64 {
        match *self {
            Self::Reverse => 1.0 - position,
            Self::Linear { start, end } => {
                let (low, high) = (displacement(start), displacement(end));
                let x = low + position * (high - low);
                let angle = (1.0 - 2.0 * x).clamp(-1.0, 1.0).acos().to_degrees();
                ((angle - start) / (end - start)).clamp(0.0, 1.0)
            },
            // 结果可能超出 0.0 ~ 1.0，由目标舵机拒绝
            Self::Scale { scale, shift } => position * scale + shift,
            Self::Sine => position.sin(),
            Self::Cosine => position.cos(),
        }
    }

    /// 目标舵机位置 -> 请求位置（`apply` 的逆），结果限制在 0.0 ~ 1.0
    pub fn resolve(&self, position: f64) -> f64 {
        match *self {
            Self::Reverse => 1.0 - position,
            Self::Linear { start, end } => {
                let (low, high) = (displacement(start), displacement(end));
                let x = displacement(start + position * (end - start));
                ((x - low) / (high - low)).clamp(0.0, 1.0)
            },
            Self::Scale { scale, shift } => ((position - shift) / scale).clamp(0.0, 1.0),
            Self::Sine => position.clamp(-1.0, 1.0).asin().clamp(0.0, 1.0),
            Self::Cosine => position.clamp(-1.0, 1.0).acos().clamp(0.0, 1.0),
        }
    }
}

/// 舵机臂角度（度）对应的归一化连杆位移
fn displacement(angle: f64) -> f64 {
    (1.0 - angle.to_radians().cos()) / 2.0
}
