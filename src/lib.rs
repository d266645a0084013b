//! # Vessel
//!
//! 纯 Rust 实现的媒体容器工具包.
//!
//! 目前提供 Matroska/WebM 随机访问解封装: 打开文件时只读取容器结构,
//! 数据包按需查找, 支持按时间定位、顺序遍历与关键帧查找.
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use vessel::format::{Demuxer, MkvDemuxer, ReadOptions, Reader};
//!
//! # async fn run(data: Vec<u8>) -> vessel::core::VesselResult<()> {
//! let demuxer = MkvDemuxer::new(Reader::from_bytes(data));
//! for track in demuxer.tracks().await? {
//!     if let Some(packet) = track.get_key_packet(5_000, ReadOptions::default()).await? {
//!         println!("轨道 {}: 关键帧 pts={}", track.id(), packet.pts);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `vessel-core` | 错误类型、时间基与时间戳 |
//! | `vessel-codec` | 编解码器标识与数据包 |
//! | `vessel-format` | 字节区间读取与 Matroska 解封装 |

pub mod logging;

/// 核心类型与工具
pub use vessel_core as core;

/// 编解码器标识与数据包
pub use vessel_codec as codec;

/// 容器格式与解封装
pub use vessel_format as format;

/// 获取 Vessel 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
