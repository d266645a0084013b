//! 有理数类型, 用于表示轨道时间基.
//!
//! Matroska 的时间刻度以"纳秒/tick"给出, 可能超出 32 位范围,
//! 因此分子分母均使用 64 位整数.

use std::fmt;

/// 每秒纳秒数
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// 有理数, 由分子和分母组成
///
/// 时间基 `num/den` 表示一个 tick 等于多少秒.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    /// 分子
    pub num: i64,
    /// 分母
    pub den: i64,
}

impl Rational {
    /// 创建新的有理数 (不约分)
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// 未定义 (分母为 0)
    pub const UNDEFINED: Self = Self { num: 0, den: 0 };

    /// 毫秒时间基 (Matroska 默认时间刻度 1_000_000 ns 对应的时间基)
    pub const MILLI: Self = Self { num: 1, den: 1_000 };

    /// 由"纳秒/tick"时间刻度构造时间基, 结果已约分
    pub fn from_timestamp_scale(scale_ns: u64) -> Self {
        let scale = i64::try_from(scale_ns).unwrap_or(i64::MAX);
        Self::new(scale, NANOS_PER_SECOND).reduce()
    }

    /// 判断是否有效 (分母不为 0)
    pub const fn is_valid(&self) -> bool {
        self.den != 0
    }

    /// 转换为 f64, 分母为 0 时返回 NaN
    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            return f64::NAN;
        }
        self.num as f64 / self.den as f64
    }

    /// 约分, 并保证分母为正
    pub fn reduce(self) -> Self {
        if self.den == 0 {
            return self;
        }
        let g = gcd(self.num.unsigned_abs(), self.den.unsigned_abs());
        if g == 0 {
            return self;
        }
        let g = g as i64;
        let sign = if self.den < 0 { -1 } else { 1 };
        Self {
            num: sign * self.num / g,
            den: sign * self.den / g,
        }
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// 求最大公约数 (欧几里得算法)
fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}
