//! 轨道媒体类型.

use std::fmt;

/// 轨道媒体类型
///
/// 只区分容器层关心的三类轨道, 其余轨道类型在索引阶段被忽略.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// 视频轨道
    Video,
    /// 音频轨道
    Audio,
    /// 字幕轨道
    Subtitle,
}

impl MediaType {
    /// MIME 顶级类型名称 (`video` / `audio` / `text`)
    pub const fn mime_prefix(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "text",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Video => "视频",
            Self::Audio => "音频",
            Self::Subtitle => "字幕",
        };
        write!(f, "{name}")
    }
}
