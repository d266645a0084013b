//! # vessel-format
//!
//! Vessel 媒体容器工具包的容器格式库.
//!
//! 目前实现 Matroska/WebM 解封装: 按需从字节区间数据源读取元素树,
//! 借助 Cues 与数据簇位置缓存完成随机访问查找.

pub mod demuxer;
pub mod demuxers;
pub mod format_id;
pub mod io;
pub mod metadata;
pub mod probe;
pub mod track;

// 重导出常用类型
pub use demuxer::{Demuxer, ReadOptions, TrackBacking};
pub use demuxers::mkv::{MkvConfig, MkvDemuxer};
pub use format_id::FormatId;
pub use io::{ByteSource, FileSlice, FileSource, MemorySource, Reader};
pub use metadata::{AttachedImage, MetadataTags};
pub use probe::{ProbeResult, probe_format};
pub use track::{AudioTrackInfo, TrackKind, VideoTrackInfo};
