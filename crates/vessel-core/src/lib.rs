//! # vessel-core
//!
//! Vessel 媒体容器工具包核心库, 提供错误类型、时间基与时间戳等基础设施.
//!
//! 其余 crate 共用这里的类型, 避免在容器解析层重复定义.

pub mod error;
pub mod media_type;
pub mod rational;
pub mod timestamp;

// 重导出常用类型
pub use error::{VesselError, VesselResult};
pub use media_type::MediaType;
pub use rational::Rational;
pub use timestamp::Timestamp;
