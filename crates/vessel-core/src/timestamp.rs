//! 以 tick 计的时间戳与秒之间的换算.

use crate::rational::Rational;

/// 表示"未定义"的时间戳值
pub const NOPTS_VALUE: i64 = i64::MIN;

/// 带时间基的时间戳
///
/// 秒数 = `pts * time_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// tick 数, `NOPTS_VALUE` 表示未定义
    pub pts: i64,
    pub time_base: Rational,
}

impl Timestamp {
    pub const fn new(pts: i64, time_base: Rational) -> Self {
        Self { pts, time_base }
    }

    /// 未定义的时间戳
    pub const fn none() -> Self {
        Self::new(NOPTS_VALUE, Rational::UNDEFINED)
    }

    /// 由秒数构造, 四舍五入到最近的 tick
    ///
    /// 时间基无效或秒数不是有限值时返回未定义的时间戳.
    pub fn from_seconds(seconds: f64, time_base: Rational) -> Self {
        if !time_base.is_valid() || time_base.num == 0 || !seconds.is_finite() {
            return Self::none();
        }
        let ticks = (seconds * time_base.den as f64 / time_base.num as f64).round();
        Self::new(ticks as i64, time_base)
    }

    pub const fn is_valid(&self) -> bool {
        self.pts != NOPTS_VALUE && self.time_base.is_valid()
    }

    /// 换算为秒, 未定义时返回 NaN
    pub fn to_seconds(&self) -> f64 {
        if self.is_valid() {
            self.pts as f64 * self.time_base.to_f64()
        } else {
            f64::NAN
        }
    }
}
